//! Daemon lifecycle owner.
//!
//! [`Service`] owns the process-wide push client, deliverer, version
//! cache, and store. It acquires the single-instance lock, binds the
//! listening socket, gives every accepted connection its own dispatcher
//! and handler set, and sequences component startup/teardown around
//! login and logout.

use courier_client::{
    Deliverer, DelivererConfig, FileStore, KvStore, MessageSender, PushClient, PushConfig,
    SendFailure, ServerVersions, StoreError,
};
use courier_core::BrokerState;
use courier_rpc::{
    Context, Dialer, Dispatcher, FramedTransport, ProtocolRegistry, RpcError, TcpDialer,
    Transport,
};
use courier_types::{codes, decode_value, encode_value, ConversationId, PostArgs, Uid};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::config::Config;
use crate::handlers;
use crate::lock::{InstanceLock, LockError};
use crate::maintenance::{self, BackgroundIdentifier};

const SESSION_TABLE: &str = "session";
const SESSION_KEY: &str = "current";

/// Fatal daemon startup errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The exclusive instance lock is held by a live daemon.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The listening endpoint could not be set up.
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// The persisted store could not be opened or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The daemon service: owns process-wide components and the listen loop.
pub struct Service {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) push: Arc<PushClient>,
    pub(crate) deliverer: Arc<Deliverer>,
    pub(crate) versions: Arc<ServerVersions>,
    pub(crate) session: tokio::sync::Mutex<Option<Uid>>,
    identifier: tokio::sync::Mutex<Option<BackgroundIdentifier>>,
    conns: DashMap<u64, Arc<Dispatcher>>,
    next_conn: AtomicU64,
    shutdown: CancellationToken,
}

impl Service {
    /// Build a service over the store configured on disk.
    pub async fn new(config: Config) -> Result<Arc<Self>, ServiceError> {
        let store: Arc<dyn KvStore> = Arc::new(FileStore::open(&config.daemon.store_path).await?);
        Ok(Self::with_store(config, store))
    }

    /// Build a service over an explicit store and dialer (used by tests).
    pub fn with_parts(
        config: Config,
        store: Arc<dyn KvStore>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        let push = PushClient::new(
            dialer,
            PushConfig {
                backoff: config.broker.backoff(),
            },
        );
        let sender = Arc::new(RemoteSender {
            push: Arc::clone(&push),
        });
        let deliverer = Deliverer::new(
            sender,
            Arc::clone(&store),
            DelivererConfig {
                backoff: config.delivery.backoff(),
                max_attempts: config.delivery.max_attempts,
            },
        );
        let versions = Arc::new(ServerVersions::new(Arc::clone(&store)));
        Arc::new(Self {
            config,
            store,
            push,
            deliverer,
            versions,
            session: tokio::sync::Mutex::new(None),
            identifier: tokio::sync::Mutex::new(None),
            conns: DashMap::new(),
            next_conn: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build a service over an explicit store with the default dialer.
    pub fn with_store(config: Config, store: Arc<dyn KvStore>) -> Arc<Self> {
        Self::with_parts(config, store, Arc::new(TcpDialer))
    }

    /// Token cancelled when the daemon should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon to completion.
    ///
    /// Startup errors (lock, socket, store) are fatal. Once listening, a
    /// single connection's failure never exits the daemon.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServiceError> {
        let _lock = InstanceLock::acquire(&self.config.daemon.pid_file)?;

        let socket_path = self.config.daemon.socket_path.clone();
        if socket_path.exists() {
            tracing::info!(?socket_path, "removing stale socket file");
            std::fs::remove_file(&socket_path)
                .map_err(|e| ServiceError::Endpoint(e.to_string()))?;
        }
        let listener =
            UnixListener::bind(&socket_path).map_err(|e| ServiceError::Endpoint(e.to_string()))?;
        tracing::info!(?socket_path, "daemon listening");

        let maintenance_task = maintenance::spawn_maintenance_task(
            Arc::downgrade(self),
            self.config.maintenance.clone(),
        );

        self.try_restore_session().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(self);
                        tokio::spawn(async move {
                            service.handle_conn(stream).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!("accept failed: {err}");
                    }
                }
            }
        }

        tracing::info!("daemon shutting down");
        maintenance_task.abort();

        let dispatchers: Vec<Arc<Dispatcher>> = self
            .conns
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for dispatcher in dispatchers {
            dispatcher.shutdown().await;
        }

        // Component teardown mirrors logout order, but the session record
        // is kept so the next start restores it.
        let ctx = Context::background();
        self.push.shutdown(&ctx).await;
        self.deliverer.stop(&ctx).await;
        if let Some(identifier) = self.identifier.lock().await.take() {
            identifier.stop().await;
        }

        if let Err(err) = std::fs::remove_file(&socket_path) {
            tracing::warn!("failed to remove socket file: {err}");
        }
        Ok(())
    }

    /// Wire one accepted connection: fresh dispatcher, fresh handlers,
    /// shared components, close teardown guarded to run exactly once.
    async fn handle_conn(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(conn_id, "accepted connection");

        let transport: Arc<dyn Transport> = Arc::new(FramedTransport::from_unix(stream));
        let dispatcher = Dispatcher::new(transport);

        let mut registry = ProtocolRegistry::new();
        if let Err(err) = handlers::register_all(&mut registry, &self) {
            tracing::error!(conn_id, "handler registration failed: {err}");
            dispatcher.shutdown().await;
            return;
        }
        dispatcher.set_incoming(Arc::new(registry));

        let weak = Arc::downgrade(&self);
        dispatcher.set_on_close(Box::new(move |err| {
            tracing::debug!(conn_id, "connection teardown: {err}");
            if let Some(service) = weak.upgrade() {
                service.conns.remove(&conn_id);
            }
        }));

        self.conns.insert(conn_id, Arc::clone(&dispatcher));
        dispatcher.start();
    }

    /// Login: start session-scoped components. Each start is
    /// independently fallible; a failure is logged and does not block the
    /// others or abort the daemon.
    pub async fn on_login(self: &Arc<Self>, ctx: &Context, uid: Uid) {
        tracing::info!(%uid, "login: starting session components");
        *self.session.lock().await = Some(uid);
        if let Err(err) = self.persist_session(Some(uid)).await {
            tracing::warn!("persisting session record failed: {err}");
        }

        // Chat sources live in the cache layer and register themselves as
        // push handlers; the sync core starts only what it owns here.
        self.push.reset(ctx).await;
        if let Err(err) = self.push.connect(ctx, &self.config.broker.uri).await {
            tracing::warn!("push connect failed on login: {err}");
        }

        if let Err(err) = self.deliverer.start(ctx, uid).await {
            tracing::warn!("deliverer start failed on login: {err}");
        }

        let mut identifier = self.identifier.lock().await;
        if identifier.is_none() {
            *identifier = Some(BackgroundIdentifier::start(
                uid,
                std::time::Duration::from_secs(self.config.maintenance.identify_interval_secs),
            ));
        }
    }

    /// The fixed logout teardown order. The push-first ordering follows
    /// observed behavior rather than a documented dependency; the
    /// integration tests exercise it.
    const LOGOUT_STEPS: [&'static str; 4] = [
        "push-client",
        "deliverer",
        "background-identifier",
        "session-record",
    ];

    /// Logout: tear session-scoped components down in a fixed sequence.
    /// Every step runs even if an earlier one fails.
    pub async fn on_logout(&self, ctx: &Context) {
        tracing::info!("logout: stopping session components");
        for step in Self::LOGOUT_STEPS {
            tracing::debug!(step, "logout step");
            if let Err(err) = self.run_logout_step(step, ctx).await {
                tracing::warn!(step, "logout step failed: {err}");
            }
        }
        *self.session.lock().await = None;
    }

    async fn run_logout_step(&self, step: &str, ctx: &Context) -> Result<(), ServiceError> {
        match step {
            "push-client" => {
                self.push.shutdown(ctx).await;
                Ok(())
            }
            "deliverer" => {
                self.deliverer.stop(ctx).await;
                Ok(())
            }
            "background-identifier" => {
                if let Some(identifier) = self.identifier.lock().await.take() {
                    identifier.stop().await;
                }
                Ok(())
            }
            "session-record" => self.persist_session(None).await,
            other => {
                tracing::error!(step = other, "unknown logout step");
                Ok(())
            }
        }
    }

    /// The currently logged-in identity, if any.
    pub async fn current_uid(&self) -> Option<Uid> {
        *self.session.lock().await
    }

    /// Periodic maintenance: redial a dropped broker session while logged
    /// in and report entries awaiting user retry.
    pub(crate) async fn run_maintenance(self: &Arc<Self>) {
        tracing::debug!("maintenance pass");
        if self.session.lock().await.is_none() {
            return;
        }

        if self.push.session_state().await == BrokerState::Disconnected {
            tracing::info!("maintenance: broker session down, redialing");
            let ctx = Context::background();
            if let Err(err) = self.push.connect(&ctx, &self.config.broker.uri).await {
                tracing::debug!("maintenance redial failed: {err}");
            }
        }

        if let Ok(failed) = self.deliverer.failed_entries(&Context::background()).await {
            if !failed.is_empty() {
                tracing::info!(count = failed.len(), "messages awaiting user retry");
            }
        }
    }

    /// Restore a persisted session on startup, so a daemon restart keeps
    /// the user logged in.
    async fn try_restore_session(self: &Arc<Self>) {
        let record = match self.store.get(SESSION_TABLE, SESSION_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("reading session record failed: {err}");
                return;
            }
        };
        match decode_value::<Option<Uid>>(&record) {
            Ok(Some(uid)) => {
                tracing::info!(%uid, "restoring persisted session");
                self.on_login(&Context::background(), uid).await;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("undecodable session record: {err}"),
        }
    }

    async fn persist_session(&self, uid: Option<Uid>) -> Result<(), ServiceError> {
        let bytes = encode_value(&uid).map_err(|e| StoreError::Io(e.to_string()))?;
        self.store.put(SESSION_TABLE, SESSION_KEY, &bytes).await?;
        Ok(())
    }
}

/// Sends sealed messages over the shared broker connection.
///
/// The signer/encryptor sits behind the remote service's `remote.post`
/// contract; from the deliverer's perspective this collaborator only
/// classifies outcomes.
struct RemoteSender {
    push: Arc<PushClient>,
}

#[async_trait]
impl MessageSender for RemoteSender {
    async fn send(
        &self,
        ctx: &Context,
        conversation: ConversationId,
        payload: &[u8],
    ) -> Result<(), SendFailure> {
        let Some(client) = self.push.remote_client().await else {
            // Offline: the entry stays queued and retries after reconnect.
            return Err(SendFailure::Transient("no broker session".into()));
        };
        let args = PostArgs {
            conversation,
            payload: payload.to_vec(),
        };
        match client.call::<_, ()>(ctx, "remote.post", &args).await {
            Ok(()) => Ok(()),
            Err(err) => Err(classify_send_error(err)),
        }
    }
}

/// Transient vs permanent policy for delivery failures: connectivity
/// problems retry, rejections and malformed requests do not.
fn classify_send_error(err: RpcError) -> SendFailure {
    match err {
        RpcError::Transport(inner) => SendFailure::Transient(inner.to_string()),
        RpcError::Cancelled { method } => SendFailure::Transient(format!("{method} cancelled")),
        RpcError::Server(wire) if wire.code == codes::INTERNAL => {
            SendFailure::Transient(wire.to_string())
        }
        RpcError::Server(wire) => SendFailure::Permanent(wire.to_string()),
        RpcError::App(inner) => SendFailure::Permanent(inner.to_string()),
        RpcError::InvalidArgument(desc) => SendFailure::Permanent(desc),
        RpcError::Codec(inner) => SendFailure::Permanent(inner.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_rpc::TransportError;
    use courier_types::WireError;

    #[test]
    fn transport_failures_are_transient() {
        let err = RpcError::Transport(TransportError::Closed);
        assert!(matches!(
            classify_send_error(err),
            SendFailure::Transient(_)
        ));
    }

    #[test]
    fn server_internal_is_transient() {
        let err = RpcError::Server(WireError::internal("db busy"));
        assert!(matches!(
            classify_send_error(err),
            SendFailure::Transient(_)
        ));
    }

    #[test]
    fn server_rejection_is_permanent() {
        let err = RpcError::Server(WireError::invalid_argument("bad conversation"));
        assert!(matches!(
            classify_send_error(err),
            SendFailure::Permanent(_)
        ));
    }
}
