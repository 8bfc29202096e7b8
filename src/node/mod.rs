//! The safehold node: one single-writer actor owning all authorization
//! state.
//!
//! Every entry point, interactive requests from the web layer and the
//! ordered stream of confirmed blocks from the gateway alike, is serialized
//! through this loop, so a grant initiated by a user and a revoke arriving
//! in a block can never race. The loop is the sole writer of registry state
//! and log sequence numbers; callers talk to it through [`NodeHandle`] with
//! oneshot replies.
//!
//! Block ingest applies each block's joins, then grants, then revokes,
//! advances the epoch watermark, and appends the confirmed raw actions to
//! the log. Outbound actions are stamped with the latest applied watermark,
//! signed with the user's custodial key, sealed in the node envelope, and
//! handed to the gateway. Unconfirmed submissions leave no trace in the
//! log.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{
    epoch_mark, parse_epoch_mark, Action, ActionLog, Envelope, GrantPower, JoinNetwork,
    RevokePower, ACTION_MESSAGE, MAX_FINGERPRINT,
};
use crate::crypto::{hash_token, Token};
use crate::gateway::{Block, Gateway};
use crate::registry::CapabilityRegistry;
use crate::sessions::SessionStore;
use crate::types::{Result, SafeError};
use crate::vault::{crypto::random_bytes, Vault};

const COMMAND_QUEUE: usize = 64;
const BLOCK_QUEUE: usize = 256;

/// What the web layer renders for a user.
#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub handle: String,
    pub attorneys: Vec<String>,
    /// True once the network confirmed the user's join.
    pub live: bool,
}

/// A grant prepared for an out-of-band confirmation flow, keyed by a
/// one-time secret. In-memory only; lost on restart by design.
#[derive(Debug, Clone)]
struct PendingGrant {
    handle: String,
    attorney: Token,
    fingerprint: Vec<u8>,
}

type Reply<T> = oneshot::Sender<T>;

/// Requests serialized into the node loop.
enum Command {
    CreateSession {
        handle: String,
        reply: Reply<Option<String>>,
    },
    SessionHandle {
        session_id: String,
        reply: Reply<Option<String>>,
    },
    SignOut {
        session_id: String,
        reply: Reply<()>,
    },
    CheckCredentials {
        handle: String,
        password: String,
        reply: Reply<bool>,
    },
    NewUser {
        handle: String,
        password: String,
        email: String,
        reply: Reply<Result<Token>>,
    },
    UpdateUser {
        handle: String,
        password: String,
        email: String,
        reply: Reply<Result<()>>,
    },
    GrantPower {
        handle: String,
        attorney: String,
        fingerprint: String,
        reply: Reply<Result<()>>,
    },
    RevokePower {
        handle: String,
        attorney: String,
        reply: Reply<Result<()>>,
    },
    CurrentAttorneys {
        handle: String,
        reply: Reply<Vec<Token>>,
    },
    EmailAndToken {
        handle: String,
        reply: Reply<Option<(String, Token)>>,
    },
    View {
        handle: String,
        reply: Reply<Option<UserView>>,
    },
    NewPending {
        handle: String,
        attorney: String,
        fingerprint: String,
        reply: Reply<Result<String>>,
    },
    ConfirmPending {
        secret: String,
        reply: Reply<Result<()>>,
    },
    ActionsFor {
        token: Token,
        reply: Reply<Result<Vec<Vec<u8>>>>,
    },
    Watermark {
        reply: Reply<u64>,
    },
    Shutdown,
}

/// The service boundary handed to the web layer. Cheap to clone; every
/// method is one round trip through the node loop.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| node_stopped())?;
        rx.await.map_err(|_| node_stopped())
    }

    /// Mint a session for a handle; `None` when the handle is unknown.
    pub async fn create_session(&self, handle: &str) -> Result<Option<String>> {
        let handle = handle.to_string();
        self.request(|reply| Command::CreateSession { handle, reply })
            .await
    }

    /// Resolve a session id back to its handle.
    pub async fn session_handle(&self, session_id: &str) -> Result<Option<String>> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::SessionHandle { session_id, reply })
            .await
    }

    pub async fn sign_out(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.request(|reply| Command::SignOut { session_id, reply })
            .await
    }

    /// Credential check; false for unknown handle and wrong password alike.
    pub async fn check_credentials(&self, handle: &str, password: &str) -> Result<bool> {
        let (handle, password) = (handle.to_string(), password.to_string());
        self.request(|reply| Command::CheckCredentials {
            handle,
            password,
            reply,
        })
        .await
    }

    /// Register a user and submit their join attestation.
    pub async fn new_user(&self, handle: &str, password: &str, email: &str) -> Result<Token> {
        let (handle, password, email) =
            (handle.to_string(), password.to_string(), email.to_string());
        self.request(|reply| Command::NewUser {
            handle,
            password,
            email,
            reply,
        })
        .await?
    }

    /// Update password and/or email; empty fields keep current values.
    pub async fn update_user(&self, handle: &str, password: &str, email: &str) -> Result<()> {
        let (handle, password, email) =
            (handle.to_string(), password.to_string(), email.to_string());
        self.request(|reply| Command::UpdateUser {
            handle,
            password,
            email,
            reply,
        })
        .await?
    }

    /// Sign and submit a grant of power of attorney.
    pub async fn grant_power(
        &self,
        handle: &str,
        attorney_hex: &str,
        fingerprint: &str,
    ) -> Result<()> {
        let (handle, attorney, fingerprint) = (
            handle.to_string(),
            attorney_hex.to_string(),
            fingerprint.to_string(),
        );
        self.request(|reply| Command::GrantPower {
            handle,
            attorney,
            fingerprint,
            reply,
        })
        .await?
    }

    /// Sign and submit a revocation of power of attorney.
    pub async fn revoke_power(&self, handle: &str, attorney_hex: &str) -> Result<()> {
        let (handle, attorney) = (handle.to_string(), attorney_hex.to_string());
        self.request(|reply| Command::RevokePower {
            handle,
            attorney,
            reply,
        })
        .await?
    }

    /// The attorneys the network currently confirms for a handle.
    pub async fn current_attorneys(&self, handle: &str) -> Result<Vec<Token>> {
        let handle = handle.to_string();
        self.request(|reply| Command::CurrentAttorneys { handle, reply })
            .await
    }

    pub async fn email_and_token(&self, handle: &str) -> Result<Option<(String, Token)>> {
        let handle = handle.to_string();
        self.request(|reply| Command::EmailAndToken { handle, reply })
            .await
    }

    pub async fn user_view(&self, handle: &str) -> Result<Option<UserView>> {
        let handle = handle.to_string();
        self.request(|reply| Command::View { handle, reply }).await
    }

    /// Prepare a grant behind a one-time confirmation secret.
    pub async fn new_pending(
        &self,
        handle: &str,
        attorney_hex: &str,
        fingerprint: &str,
    ) -> Result<String> {
        let (handle, attorney, fingerprint) = (
            handle.to_string(),
            attorney_hex.to_string(),
            fingerprint.to_string(),
        );
        self.request(|reply| Command::NewPending {
            handle,
            attorney,
            fingerprint,
            reply,
        })
        .await?
    }

    /// Exercise a one-time confirmation secret, submitting its grant.
    pub async fn confirm_pending(&self, secret: &str) -> Result<()> {
        let secret = secret.to_string();
        self.request(|reply| Command::ConfirmPending { secret, reply })
            .await?
    }

    /// Audit trail: every confirmed action mentioning a token, in
    /// confirmation order.
    pub async fn actions_for(&self, token: Token) -> Result<Vec<Vec<u8>>> {
        self.request(|reply| Command::ActionsFor { token, reply })
            .await?
    }

    /// Latest applied epoch watermark.
    pub async fn watermark(&self) -> Result<u64> {
        self.request(|reply| Command::Watermark { reply }).await
    }

    /// Ask the node loop to stop; it flushes and releases its stores.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

fn node_stopped() -> SafeError {
    SafeError::SendFailure("node service stopped".into())
}

/// The actor state. Constructed and driven by [`Node::spawn`].
pub struct Node {
    vault: Vault,
    log: ActionLog,
    registry: CapabilityRegistry,
    sessions: SessionStore,
    pending: HashMap<String, PendingGrant>,
    watermark: u64,
    gateway: Arc<dyn Gateway>,
}

impl Node {
    /// Bootstrap the node from its stores and start the single-writer
    /// loop.
    ///
    /// Every vault handle gets an unconfirmed registry entry, then the
    /// action log is replayed in sequence to restore confirmed state and
    /// the watermark.
    pub fn spawn(
        vault: Vault,
        mut log: ActionLog,
        gateway: Arc<dyn Gateway>,
    ) -> Result<(NodeHandle, mpsc::Sender<Block>, JoinHandle<Result<()>>)> {
        let mut registry = CapabilityRegistry::new();
        for (handle, token) in vault.handles() {
            registry.insert(&handle, token);
        }

        let mut watermark = 0u64;
        let mut replayed = 0usize;
        for sequence in 0..log.len() {
            let raw = log.payload_at(sequence)?;
            // Epoch markers record every watermark advance, so the restored
            // watermark is the confirmation epoch, not an action's (older)
            // build epoch.
            if let Some(epoch) = parse_epoch_mark(&raw) {
                watermark = watermark.max(epoch);
                continue;
            }
            match Action::parse(&raw) {
                Some(action) => {
                    apply_parsed(&mut registry, &action);
                    replayed += 1;
                }
                None => warn!(sequence, "skipping unparseable logged action"),
            }
        }
        info!(
            users = vault.handles().len(),
            replayed, watermark, "node state restored"
        );

        let node = Node {
            vault,
            log,
            registry,
            sessions: SessionStore::default(),
            pending: HashMap::new(),
            watermark,
            gateway,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (block_tx, block_rx) = mpsc::channel(BLOCK_QUEUE);
        let task = tokio::spawn(node.run(command_rx, block_rx));
        Ok((
            NodeHandle {
                commands: command_tx,
            },
            block_tx,
            task,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut blocks: mpsc::Receiver<Block>,
    ) -> Result<()> {
        let mut blocks_open = true;
        loop {
            tokio::select! {
                maybe_command = commands.recv() => match maybe_command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                maybe_block = blocks.recv(), if blocks_open => match maybe_block {
                    Some(block) => self.apply_block(block),
                    // Gateway reader gone; keep serving local requests.
                    None => blocks_open = false,
                },
            }
        }
        info!("node loop stopped, flushing stores");
        self.log.close()?;
        self.vault.close()?;
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateSession { handle, reply } => {
                let session = self
                    .vault
                    .token(&handle)
                    .map(|token| self.sessions.create(&handle, token));
                let _ = reply.send(session);
            }
            Command::SessionHandle { session_id, reply } => {
                let handle = self.sessions.validate(&session_id).map(|s| s.handle);
                let _ = reply.send(handle);
            }
            Command::SignOut { session_id, reply } => {
                self.sessions.remove(&session_id);
                let _ = reply.send(());
            }
            Command::CheckCredentials {
                handle,
                password,
                reply,
            } => {
                let _ = reply.send(self.vault.check(&handle, &password));
            }
            Command::NewUser {
                handle,
                password,
                email,
                reply,
            } => {
                let _ = reply.send(self.register_user(&handle, &password, &email).await);
            }
            Command::UpdateUser {
                handle,
                password,
                email,
                reply,
            } => {
                let result = self.vault.update_user(&handle, &password, &email);
                if result.is_ok() && !password.is_empty() {
                    // Password changed: existing sessions are stale.
                    if let Some(token) = self.vault.token(&handle) {
                        self.sessions.remove_token(&token);
                    }
                }
                let _ = reply.send(result);
            }
            Command::GrantPower {
                handle,
                attorney,
                fingerprint,
                reply,
            } => {
                let _ = reply.send(
                    self.submit_grant(&handle, &attorney, fingerprint.as_bytes())
                        .await,
                );
            }
            Command::RevokePower {
                handle,
                attorney,
                reply,
            } => {
                let _ = reply.send(self.submit_revoke(&handle, &attorney).await);
            }
            Command::CurrentAttorneys { handle, reply } => {
                let _ = reply.send(self.registry.attorneys_of(&handle));
            }
            Command::EmailAndToken { handle, reply } => {
                let _ = reply.send(self.vault.email_and_token(&handle));
            }
            Command::View { handle, reply } => {
                let view = self.registry.get(&handle).map(|user| UserView {
                    handle: user.handle.clone(),
                    attorneys: user.attorneys.iter().map(Token::to_hex).collect(),
                    live: user.confirmed,
                });
                let _ = reply.send(view);
            }
            Command::NewPending {
                handle,
                attorney,
                fingerprint,
                reply,
            } => {
                let _ = reply.send(self.new_pending(&handle, &attorney, &fingerprint));
            }
            Command::ConfirmPending { secret, reply } => {
                let _ = reply.send(self.confirm_pending(&secret).await);
            }
            Command::ActionsFor { token, reply } => {
                let _ = reply.send(self.log.lookup_by_hash(&hash_token(&token)));
            }
            Command::Watermark { reply } => {
                let _ = reply.send(self.watermark);
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Register a user: vault append, optimistic registry entry, signed
    /// join submission. A failed submission is logged but does not undo
    /// the registration: the user exists, their join is simply not yet
    /// on the network.
    async fn register_user(&mut self, handle: &str, password: &str, email: &str) -> Result<Token> {
        let token = self.vault.new_user(handle, password, email)?;
        self.registry.insert(handle, token);

        let key = self
            .vault
            .signing_key(handle)
            .ok_or_else(|| SafeError::NotFound(handle.to_string()))?;
        let join = JoinNetwork::signed(self.watermark, &key, handle);
        if let Err(e) = self.submit(join.serialize()).await {
            warn!(%handle, "join submission failed: {e}");
        }
        Ok(token)
    }

    async fn submit_grant(
        &mut self,
        handle: &str,
        attorney_hex: &str,
        fingerprint: &[u8],
    ) -> Result<()> {
        if fingerprint.len() > MAX_FINGERPRINT {
            return Err(SafeError::PayloadTooLarge(fingerprint.len()));
        }
        let attorney = Token::from_hex(attorney_hex)?;
        let key = self
            .vault
            .signing_key(handle)
            .ok_or_else(|| SafeError::NotFound(handle.to_string()))?;
        let grant = GrantPower::signed(self.watermark, &key, attorney, fingerprint);
        self.submit(grant.serialize()).await
    }

    async fn submit_revoke(&mut self, handle: &str, attorney_hex: &str) -> Result<()> {
        let attorney = Token::from_hex(attorney_hex)?;
        let key = self
            .vault
            .signing_key(handle)
            .ok_or_else(|| SafeError::NotFound(handle.to_string()))?;
        let revoke = RevokePower::signed(self.watermark, &key, attorney);
        self.submit(revoke.serialize()).await
    }

    fn new_pending(&mut self, handle: &str, attorney_hex: &str, fingerprint: &str) -> Result<String> {
        if fingerprint.len() > MAX_FINGERPRINT {
            return Err(SafeError::PayloadTooLarge(fingerprint.len()));
        }
        if !self.vault.contains(handle) {
            return Err(SafeError::NotFound(handle.to_string()));
        }
        let attorney = Token::from_hex(attorney_hex)?;
        let secret = hex::encode(random_bytes::<32>());
        self.pending.insert(
            secret.clone(),
            PendingGrant {
                handle: handle.to_string(),
                attorney,
                fingerprint: fingerprint.as_bytes().to_vec(),
            },
        );
        Ok(secret)
    }

    async fn confirm_pending(&mut self, secret: &str) -> Result<()> {
        let pending = self
            .pending
            .remove(secret)
            .ok_or_else(|| SafeError::NotFound("confirmation secret".to_string()))?;
        let key = self
            .vault
            .signing_key(&pending.handle)
            .ok_or_else(|| SafeError::NotFound(pending.handle.clone()))?;
        let grant = GrantPower::signed(self.watermark, &key, pending.attorney, &pending.fingerprint);
        self.submit(grant.serialize()).await
    }

    /// Seal an action in the node envelope and hand it to the gateway. No
    /// retry, no outbox: a failure is reported and the action is gone.
    /// Only the network's confirmation would have made it durable anyway.
    async fn submit(&mut self, action: Vec<u8>) -> Result<()> {
        let envelope = Envelope::seal(
            ACTION_MESSAGE,
            self.vault.node_key(),
            self.watermark,
            action,
        );
        match self.gateway.send(envelope.serialize()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("gateway send failed: {e}");
                Err(SafeError::SendFailure(e.to_string()))
            }
        }
    }

    /// Apply one confirmed block: joins, then grants, then revokes, then
    /// advance the watermark, then append the applied actions to the log.
    /// Malformed actions are dropped with a warning and do not abort the
    /// rest of the block.
    fn apply_block(&mut self, block: Block) {
        debug!(
            epoch = block.epoch,
            actions = block.action_count(),
            "applying block"
        );
        let mut confirmed = Vec::with_capacity(block.action_count());
        for raw in block
            .joins
            .into_iter()
            .chain(block.grants)
            .chain(block.revokes)
        {
            match Action::parse(&raw) {
                Some(action) => {
                    apply_parsed(&mut self.registry, &action);
                    confirmed.push(raw);
                }
                None => warn!(epoch = block.epoch, "dropping malformed confirmed action"),
            }
        }
        let advanced = block.epoch > self.watermark;
        if advanced {
            self.watermark = block.epoch;
        }
        for raw in confirmed {
            if let Err(e) = self.log.append(&raw) {
                warn!("failed to append confirmed action: {e}");
            }
        }
        // Persist the advance so a restart replays back to this watermark.
        if advanced {
            if let Err(e) = self.log.append(&epoch_mark(self.watermark)) {
                warn!("failed to append epoch marker: {e}");
            }
        }
    }
}

fn apply_parsed(registry: &mut CapabilityRegistry, action: &Action) {
    match action {
        Action::Join(join) => registry.apply_join(&join.author),
        Action::Grant(grant) => registry.apply_grant(&grant.author, &grant.attorney),
        Action::Revoke(revoke) => registry.apply_revoke(&revoke.author, &revoke.attorney),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::token_indexer;
    use crate::crypto::generate_keypair;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Captures everything the node sends instead of dialing anywhere.
    struct MockGateway {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl MockGateway {
        fn new() -> Arc<MockGateway> {
            Arc::new(MockGateway {
                sent: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<MockGateway> {
            Arc::new(MockGateway {
                sent: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        /// The action payload inside the n-th sent envelope, after
        /// checking the envelope signature.
        async fn sent_action(&self, n: usize) -> Vec<u8> {
            let sent = self.sent.lock().await;
            let envelope = Envelope::parse(&sent[n]).expect("sent frame is an envelope");
            assert!(envelope.verify(), "envelope signature must verify");
            assert_eq!(envelope.kind, ACTION_MESSAGE);
            envelope.payload
        }

        async fn sent_count(&self) -> usize {
            self.sent.lock().await.len()
        }
    }

    #[async_trait::async_trait]
    impl Gateway for MockGateway {
        async fn send(&self, data: Vec<u8>) -> Result<()> {
            if self.fail {
                return Err(SafeError::SendFailure("mock gateway down".into()));
            }
            self.sent.lock().await.push(data);
            Ok(())
        }
    }

    struct Fixture {
        handle: NodeHandle,
        blocks: mpsc::Sender<Block>,
        gateway: Arc<MockGateway>,
        task: JoinHandle<Result<()>>,
        dir: tempfile::TempDir,
    }

    fn open_stores(dir: &tempfile::TempDir) -> (Vault, ActionLog) {
        let vault = Vault::open("passphrase", &dir.path().join("users.vault")).unwrap();
        let log = ActionLog::open(&dir.path().join("actions.log"), Box::new(token_indexer)).unwrap();
        (vault, log)
    }

    fn start() -> Fixture {
        start_with(MockGateway::new())
    }

    fn start_with(gateway: Arc<MockGateway>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (vault, log) = open_stores(&dir);
        let (handle, blocks, task) = Node::spawn(vault, log, gateway.clone()).unwrap();
        Fixture {
            handle,
            blocks,
            gateway,
            task,
            dir,
        }
    }

    /// Wait until the node reports the expected watermark, proving all
    /// earlier blocks on the channel have been applied.
    async fn wait_for_watermark(handle: &NodeHandle, expected: u64) {
        for _ in 0..100 {
            if handle.watermark().await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watermark never reached {expected}");
    }

    fn block_with(epoch: u64, actions: &[Vec<u8>]) -> Block {
        let mut block = Block::empty(epoch);
        for action in actions {
            assert!(block.push_action(action.clone()));
        }
        block
    }

    #[tokio::test]
    async fn test_new_user_join_confirmation_flow() {
        let fx = start();

        let token = fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        assert!(fx.handle.check_credentials("alice", "pw1").await.unwrap());
        assert!(!fx.handle.check_credentials("alice", "wrong").await.unwrap());
        assert!(!fx.handle.check_credentials("nobody", "pw1").await.unwrap());

        // The join went out signed by alice's custodial key.
        let join_raw = fx.gateway.sent_action(0).await;
        let action = Action::parse(&join_raw).unwrap();
        assert!(action.verify());
        assert_eq!(action.author(), token);

        // Optimistic state: present but not live yet.
        let view = fx.handle.user_view("alice").await.unwrap().unwrap();
        assert!(!view.live);

        // The network confirms the join.
        fx.blocks.send(block_with(5, &[join_raw])).await.unwrap();
        wait_for_watermark(&fx.handle, 5).await;

        let view = fx.handle.user_view("alice").await.unwrap().unwrap();
        assert!(view.live);
    }

    #[tokio::test]
    async fn test_grant_then_revoke_scenario() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        let (_, attorney) = generate_keypair();

        fx.handle
            .grant_power("alice", &attorney.to_hex(), "doc-fp")
            .await
            .unwrap();
        let grant_raw = fx.gateway.sent_action(1).await;
        fx.blocks.send(block_with(5, &[grant_raw])).await.unwrap();
        wait_for_watermark(&fx.handle, 5).await;

        assert_eq!(
            fx.handle.current_attorneys("alice").await.unwrap(),
            vec![attorney]
        );

        // Actions built after the block carry its epoch.
        fx.handle
            .revoke_power("alice", &attorney.to_hex())
            .await
            .unwrap();
        let revoke_raw = fx.gateway.sent_action(2).await;
        let revoke = Action::parse(&revoke_raw).unwrap();
        assert_eq!(revoke.epoch(), 5);

        fx.blocks.send(block_with(6, &[revoke_raw])).await.unwrap();
        wait_for_watermark(&fx.handle, 6).await;
        assert!(fx.handle.current_attorneys("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let fx = start();
        fx.blocks.send(Block::empty(5)).await.unwrap();
        wait_for_watermark(&fx.handle, 5).await;

        // A lower-epoch block never moves the watermark backwards.
        fx.blocks.send(Block::empty(3)).await.unwrap();
        fx.blocks.send(Block::empty(5)).await.unwrap();
        wait_for_watermark(&fx.handle, 5).await;
        assert_eq!(fx.handle.watermark().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_malformed_action_does_not_abort_block() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        let (_, attorney) = generate_keypair();
        fx.handle
            .grant_power("alice", &attorney.to_hex(), "")
            .await
            .unwrap();
        let grant_raw = fx.gateway.sent_action(1).await;

        let mut block = Block::empty(4);
        // Kind tag says join, body is junk.
        assert!(block.push_action(vec![0, 1, 2, 3]));
        assert!(block.push_action(grant_raw));
        fx.blocks.send(block).await.unwrap();
        wait_for_watermark(&fx.handle, 4).await;

        // The valid grant still applied.
        assert_eq!(
            fx.handle.current_attorneys("alice").await.unwrap(),
            vec![attorney]
        );
    }

    #[tokio::test]
    async fn test_duplicate_handle_and_invalid_attorney() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();

        let result = fx.handle.new_user("alice", "pw2", "b@x.com").await;
        assert!(matches!(result, Err(SafeError::DuplicateHandle(_))));

        let result = fx.handle.grant_power("alice", "not-a-token", "").await;
        assert!(matches!(result, Err(SafeError::InvalidToken(_))));

        let (_, attorney) = generate_keypair();
        let result = fx.handle.grant_power("ghost", &attorney.to_hex(), "").await;
        assert!(matches!(result, Err(SafeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_oversized_fields_rejected_before_submission() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();

        let result = fx.handle.new_user("bob", "pw2", &"x".repeat(70_000)).await;
        assert!(matches!(result, Err(SafeError::PayloadTooLarge(_))));

        let (_, attorney) = generate_keypair();
        let huge_fingerprint = "f".repeat(MAX_FINGERPRINT + 1);
        let result = fx
            .handle
            .grant_power("alice", &attorney.to_hex(), &huge_fingerprint)
            .await;
        assert!(matches!(result, Err(SafeError::PayloadTooLarge(_))));

        let result = fx
            .handle
            .new_pending("alice", &attorney.to_hex(), &huge_fingerprint)
            .await;
        assert!(matches!(result, Err(SafeError::PayloadTooLarge(_))));

        // Only alice's join ever reached the gateway.
        assert_eq!(fx.gateway.sent_count().await, 1);
        assert!(fx.handle.check_credentials("alice", "pw1").await.unwrap());
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_and_leaves_no_trace() {
        let fx = start_with(MockGateway::failing());
        // Registration survives a failed join submission.
        let token = fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        assert!(fx.handle.check_credentials("alice", "pw1").await.unwrap());

        let (_, attorney) = generate_keypair();
        let result = fx.handle.grant_power("alice", &attorney.to_hex(), "").await;
        assert!(matches!(result, Err(SafeError::SendFailure(_))));

        // Nothing was appended to the log for unconfirmed submissions.
        assert!(fx.handle.actions_for(token).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();

        assert_eq!(fx.handle.create_session("ghost").await.unwrap(), None);

        let session = fx.handle.create_session("alice").await.unwrap().unwrap();
        assert_eq!(
            fx.handle.session_handle(&session).await.unwrap(),
            Some("alice".to_string())
        );

        fx.handle.sign_out(&session).await.unwrap();
        assert_eq!(fx.handle.session_handle(&session).await.unwrap(), None);

        // Password change invalidates remaining sessions.
        let session = fx.handle.create_session("alice").await.unwrap().unwrap();
        fx.handle.update_user("alice", "pw2", "").await.unwrap();
        assert_eq!(fx.handle.session_handle(&session).await.unwrap(), None);
        assert!(fx.handle.check_credentials("alice", "pw2").await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_confirmation_is_one_time() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        let (_, attorney) = generate_keypair();

        let secret = fx
            .handle
            .new_pending("alice", &attorney.to_hex(), "app-fp")
            .await
            .unwrap();

        fx.handle.confirm_pending(&secret).await.unwrap();
        let grant_raw = fx.gateway.sent_action(1).await;
        match Action::parse(&grant_raw).unwrap() {
            Action::Grant(grant) => {
                assert_eq!(grant.attorney, attorney);
                assert_eq!(grant.fingerprint, b"app-fp");
            }
            other => panic!("expected grant, got {other:?}"),
        }

        // The secret is consumed.
        let result = fx.handle.confirm_pending(&secret).await;
        assert!(matches!(result, Err(SafeError::NotFound(_))));
        assert_eq!(fx.gateway.sent_count().await, 2);
    }

    #[tokio::test]
    async fn test_actions_for_serves_both_parties() {
        let fx = start();
        let alice = fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        let (_, attorney) = generate_keypair();
        fx.handle
            .grant_power("alice", &attorney.to_hex(), "")
            .await
            .unwrap();
        let grant_raw = fx.gateway.sent_action(1).await;
        fx.blocks
            .send(block_with(2, &[grant_raw.clone()]))
            .await
            .unwrap();
        wait_for_watermark(&fx.handle, 2).await;

        assert_eq!(fx.handle.actions_for(alice).await.unwrap(), vec![grant_raw.clone()]);
        assert_eq!(fx.handle.actions_for(attorney).await.unwrap(), vec![grant_raw]);
    }

    #[tokio::test]
    async fn test_watermark_survives_restart_of_empty_epochs() {
        let fx = start();
        // Heartbeats only, no confirmed actions.
        fx.blocks.send(Block::empty(9)).await.unwrap();
        wait_for_watermark(&fx.handle, 9).await;

        fx.handle.shutdown().await;
        fx.task.await.unwrap().unwrap();

        let (vault, log) = open_stores(&fx.dir);
        let (handle, _blocks, task) = Node::spawn(vault, log, fx.gateway.clone()).unwrap();
        assert_eq!(handle.watermark().await.unwrap(), 9);

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_state_restored_after_restart() {
        let fx = start();
        fx.handle.new_user("alice", "pw1", "a@x.com").await.unwrap();
        let join_raw = fx.gateway.sent_action(0).await;
        let (_, attorney) = generate_keypair();
        fx.handle
            .grant_power("alice", &attorney.to_hex(), "")
            .await
            .unwrap();
        let grant_raw = fx.gateway.sent_action(1).await;

        fx.blocks
            .send(block_with(7, &[join_raw, grant_raw]))
            .await
            .unwrap();
        wait_for_watermark(&fx.handle, 7).await;

        fx.handle.shutdown().await;
        fx.task.await.unwrap().unwrap();

        // Reopen the same stores: replay restores users, confirmation,
        // attorneys and the watermark.
        let (vault, log) = open_stores(&fx.dir);
        let (handle, _blocks, task) = Node::spawn(vault, log, fx.gateway.clone()).unwrap();

        assert!(handle.check_credentials("alice", "pw1").await.unwrap());
        let view = handle.user_view("alice").await.unwrap().unwrap();
        assert!(view.live);
        assert_eq!(view.attorneys, vec![attorney.to_hex()]);
        assert_eq!(handle.watermark().await.unwrap(), 7);

        handle.shutdown().await;
        task.await.unwrap().unwrap();
    }
}
