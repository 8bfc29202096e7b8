//! The seam toward the trusted network relay.
//!
//! Outbound: the [`Gateway`] trait takes sealed envelopes and delivers them
//! to the relay. Inbound: a reader task decodes the ordered stream of
//! confirmed messages and funnels them, as [`Block`]s, into the single
//! channel the node's ingest loop consumes.

pub mod decode;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{Result, SafeError};

pub use decode::{blocks_from_message, decode_message, Block, InboundMessage};

/// Outbound sender toward the relay. The node never retries; delivery
/// guarantees beyond the connection are the relay's problem.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send(&self, data: Vec<u8>) -> Result<()>;
}

/// Gateway over a length-framed TCP connection: `[u32 LE length][bytes]`
/// in both directions.
pub struct TcpGateway {
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpGateway {
    /// Dial the relay. Returns the sender plus the read half for
    /// [`spawn_reader`].
    pub async fn connect(addr: &str) -> Result<(TcpGateway, OwnedReadHalf)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SafeError::Config(format!("cannot reach gateway at {addr}: {e}")))?;
        info!(%addr, "connected to gateway");
        let (read, write) = stream.into_split();
        Ok((
            TcpGateway {
                writer: Mutex::new(write),
            },
            read,
        ))
    }
}

#[async_trait]
impl Gateway for TcpGateway {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(data.len() as u32).to_le_bytes())
            .await
            .map_err(|e| SafeError::SendFailure(e.to_string()))?;
        writer
            .write_all(&data)
            .await
            .map_err(|e| SafeError::SendFailure(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SafeError::SendFailure(e.to_string()))?;
        Ok(())
    }
}

/// Read framed messages off the relay connection, decode them, and push
/// the resulting blocks into the ingest channel in arrival order.
///
/// Exits when the connection closes or the node side hangs up.
pub fn spawn_reader(mut read: OwnedReadHalf, blocks: mpsc::Sender<Block>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_epoch = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            if let Err(e) = read.read_exact(&mut len_bytes).await {
                info!("gateway connection closed: {e}");
                return;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut frame = vec![0u8; len];
            if let Err(e) = read.read_exact(&mut frame).await {
                warn!("gateway connection dropped mid-frame: {e}");
                return;
            }

            let Some(message) = decode_message(&frame) else {
                warn!(len, "skipping malformed gateway message");
                continue;
            };
            for block in blocks_from_message(message, &mut last_epoch) {
                debug!(
                    epoch = block.epoch,
                    actions = block.action_count(),
                    "inbound block"
                );
                if blocks.send(block).await.is_err() {
                    // Node stopped consuming; nothing left to do here.
                    return;
                }
            }
        }
    })
}
