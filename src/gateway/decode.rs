//! Decoding of inbound gateway messages into confirmed blocks.
//!
//! The gateway pushes three message shapes down the connection:
//!
//! ```text
//! [0][u64 epoch]                          epoch heartbeat
//! [1][action bytes]                       one confirmed action
//! [2]{[u64 epoch][u32 count]{[u16 len][bytes]}...}...   multi-block batch
//! ```
//!
//! Everything is normalized into [`Block`]s, the unit the ingest loop
//! applies, with actions already split into per-kind lists so application
//! order inside a block is always joins, then grants, then revokes.

use tracing::warn;

use crate::actions::{Action, GRANT_KIND, JOIN_KIND, REVOKE_KIND};
use crate::wire::Reader;

pub const MSG_EPOCH: u8 = 0;
pub const MSG_ACTION: u8 = 1;
pub const MSG_BLOCKS: u8 = 2;

/// An ordered batch of confirmed actions for one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub epoch: u64,
    pub joins: Vec<Vec<u8>>,
    pub grants: Vec<Vec<u8>>,
    pub revokes: Vec<Vec<u8>>,
}

impl Block {
    pub fn empty(epoch: u64) -> Block {
        Block {
            epoch,
            ..Block::default()
        }
    }

    /// File a raw action into its kind list. Returns false (and drops the
    /// action) when the kind tag is unknown.
    pub fn push_action(&mut self, raw: Vec<u8>) -> bool {
        match Action::kind_of(&raw) {
            Some(JOIN_KIND) => self.joins.push(raw),
            Some(GRANT_KIND) => self.grants.push(raw),
            Some(REVOKE_KIND) => self.revokes.push(raw),
            _ => return false,
        }
        true
    }

    pub fn action_count(&self) -> usize {
        self.joins.len() + self.grants.len() + self.revokes.len()
    }
}

/// A decoded inbound gateway message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Epoch(u64),
    Action(Vec<u8>),
    Blocks(Vec<Block>),
}

/// Decode one framed gateway message. `None` means malformed; the caller
/// logs and skips it.
pub fn decode_message(data: &[u8]) -> Option<InboundMessage> {
    let mut reader = Reader::new(data);
    match reader.u8()? {
        MSG_EPOCH => {
            let epoch = reader.u64()?;
            if !reader.is_done() {
                return None;
            }
            Some(InboundMessage::Epoch(epoch))
        }
        MSG_ACTION => {
            let action = reader.take(reader.remaining())?;
            if action.is_empty() {
                return None;
            }
            Some(InboundMessage::Action(action.to_vec()))
        }
        MSG_BLOCKS => {
            let mut blocks = Vec::new();
            while !reader.is_done() {
                let mut block = Block::empty(reader.u64()?);
                let count = reader.u32()?;
                for _ in 0..count {
                    let raw = reader.bytes()?.to_vec();
                    if !block.push_action(raw) {
                        warn!(epoch = block.epoch, "dropping action of unknown kind");
                    }
                }
                blocks.push(block);
            }
            Some(InboundMessage::Blocks(blocks))
        }
        kind => {
            warn!(kind, "unknown gateway message kind");
            None
        }
    }
}

/// Fold a decoded message into the ordered block stream.
///
/// Single-action messages carry no epoch of their own; they apply at the
/// last epoch seen on this (ordered) connection, which `last_epoch` tracks.
pub fn blocks_from_message(message: InboundMessage, last_epoch: &mut u64) -> Vec<Block> {
    match message {
        InboundMessage::Epoch(epoch) => {
            *last_epoch = (*last_epoch).max(epoch);
            vec![Block::empty(epoch)]
        }
        InboundMessage::Action(raw) => {
            let mut block = Block::empty(*last_epoch);
            if !block.push_action(raw) {
                warn!("dropping single action of unknown kind");
            }
            vec![block]
        }
        InboundMessage::Blocks(blocks) => {
            if let Some(max) = blocks.iter().map(|b| b.epoch).max() {
                *last_epoch = (*last_epoch).max(max);
            }
            blocks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{GrantPower, JoinNetwork, RevokePower};
    use crate::crypto::generate_keypair;
    use crate::wire::{put_bytes, put_u64};

    fn encode_blocks(blocks: &[(u64, Vec<Vec<u8>>)]) -> Vec<u8> {
        let mut out = vec![MSG_BLOCKS];
        for (epoch, actions) in blocks {
            put_u64(*epoch, &mut out);
            out.extend_from_slice(&(actions.len() as u32).to_le_bytes());
            for action in actions {
                put_bytes(action, &mut out);
            }
        }
        out
    }

    #[test]
    fn test_decode_epoch_heartbeat() {
        let mut data = vec![MSG_EPOCH];
        put_u64(99, &mut data);
        assert_eq!(decode_message(&data), Some(InboundMessage::Epoch(99)));

        data.push(0); // trailing junk
        assert_eq!(decode_message(&data), None);
    }

    #[test]
    fn test_decode_single_action() {
        let (key, _) = generate_keypair();
        let join = JoinNetwork::signed(1, &key, "alice").serialize();

        let mut data = vec![MSG_ACTION];
        data.extend_from_slice(&join);
        assert_eq!(decode_message(&data), Some(InboundMessage::Action(join)));

        assert_eq!(decode_message(&[MSG_ACTION]), None);
    }

    #[test]
    fn test_decode_multi_block_splits_by_kind() {
        let (key, _) = generate_keypair();
        let (_, attorney) = generate_keypair();
        let join = JoinNetwork::signed(1, &key, "alice").serialize();
        let grant = GrantPower::signed(1, &key, attorney, b"fp").serialize();
        let revoke = RevokePower::signed(2, &key, attorney).serialize();

        let data = encode_blocks(&[
            (5, vec![revoke.clone(), join.clone(), grant.clone()]),
            (6, vec![]),
        ]);

        let Some(InboundMessage::Blocks(blocks)) = decode_message(&data) else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].epoch, 5);
        assert_eq!(blocks[0].joins, vec![join]);
        assert_eq!(blocks[0].grants, vec![grant]);
        assert_eq!(blocks[0].revokes, vec![revoke]);
        assert_eq!(blocks[1], Block::empty(6));
    }

    #[test]
    fn test_decode_truncated_block_is_malformed() {
        let (key, _) = generate_keypair();
        let join = JoinNetwork::signed(1, &key, "alice").serialize();
        let mut data = encode_blocks(&[(5, vec![join])]);
        data.truncate(data.len() - 2);
        assert_eq!(decode_message(&data), None);
    }

    #[test]
    fn test_single_action_applies_at_last_epoch() {
        let (key, _) = generate_keypair();
        let join = JoinNetwork::signed(1, &key, "alice").serialize();

        let mut last_epoch = 0;
        let blocks = blocks_from_message(InboundMessage::Epoch(7), &mut last_epoch);
        assert_eq!(blocks, vec![Block::empty(7)]);
        assert_eq!(last_epoch, 7);

        let blocks = blocks_from_message(InboundMessage::Action(join.clone()), &mut last_epoch);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].epoch, 7);
        assert_eq!(blocks[0].joins, vec![join]);
    }
}
