//! Push notification client.
//!
//! Maintains a live session against the central broker, replays missed
//! items on connect, fans incoming items out to registered handlers, and
//! owns the reconnect policy. The session lifecycle itself is the pure
//! state machine in `courier_core::session`; this module executes its
//! actions against real transports and timers.

use courier_core::{Backoff, BrokerAction, BrokerEvent, BrokerSession, BrokerState};
use courier_rpc::{
    Context, Dialer, Dispatcher, IncomingHandler, RpcClient, RpcError, TransportError,
    UnwrapErrorFn,
};
use courier_types::{
    codes, decode_value, Category, DismissArgs, InjectArgs, InjectRes, Item, ItemId, OobmArgs,
    SyncArgs, SyncRes, WireError,
};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

/// Typed broker errors produced by the push client's error unwrapper.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker rejected the session credentials.
    #[error("broker rejected session auth: {0}")]
    AuthRejected(String),
}

/// Push client errors.
#[derive(Debug, Error)]
pub enum PushError {
    /// No live broker session.
    #[error("not connected to broker")]
    NotConnected,

    /// Session credentials were rejected; no retry until the next login.
    #[error("auth rejected: {0}")]
    AuthRejected(String),

    /// An RPC against the broker failed.
    #[error(transparent)]
    Rpc(RpcError),

    /// The broker could not be reached.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<RpcError> for PushError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::App(inner) => match inner.downcast::<BrokerError>() {
                Ok(broker) => match *broker {
                    BrokerError::AuthRejected(desc) => PushError::AuthRejected(desc),
                },
                Err(other) => PushError::Rpc(RpcError::App(other)),
            },
            other => PushError::Rpc(other),
        }
    }
}

/// What a handler wants done with an item after reacting to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the item in place for other consumers / future replay.
    Keep,
    /// Acknowledge the item so the broker stops replaying it.
    Dismiss,
}

/// A subsystem interested in broker items.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// React to one item. Re-delivery of an id this handler has already
    /// acted on is filtered out before this is called.
    async fn handle(
        &self,
        ctx: &Context,
        item: &Item,
    ) -> Result<Disposition, Box<dyn std::error::Error + Send + Sync>>;
}

/// Typed handler registry: one slot per category, dispatched by
/// exhaustive match. Registrations are append-only for the process
/// lifetime.
#[derive(Default)]
struct HandlerRegistry {
    badge: Vec<Arc<dyn ItemHandler>>,
    rekey: Vec<Arc<dyn ItemHandler>>,
    user_changed: Vec<Arc<dyn ItemHandler>>,
    chat_activity: Vec<Arc<dyn ItemHandler>>,
    sync_marker: Vec<Arc<dyn ItemHandler>>,
}

impl HandlerRegistry {
    fn register(&mut self, categories: &[Category], handler: Arc<dyn ItemHandler>) {
        for category in categories {
            let slot = match category {
                Category::Badge => &mut self.badge,
                Category::Rekey => &mut self.rekey,
                Category::UserChanged => &mut self.user_changed,
                Category::ChatActivity => &mut self.chat_activity,
                Category::SyncMarker => &mut self.sync_marker,
            };
            slot.push(Arc::clone(&handler));
        }
    }

    fn handlers_for(&self, category: Category) -> Vec<Arc<dyn ItemHandler>> {
        let slot = match category {
            Category::Badge => &self.badge,
            Category::Rekey => &self.rekey,
            Category::UserChanged => &self.user_changed,
            Category::ChatActivity => &self.chat_activity,
            Category::SyncMarker => &self.sync_marker,
        };
        slot.clone()
    }
}

/// Push client configuration.
#[derive(Debug, Clone, Default)]
pub struct PushConfig {
    /// Reconnect backoff curve.
    pub backoff: Backoff,
}

struct ActiveConn {
    client: RpcClient,
    dispatcher: Arc<Dispatcher>,
}

struct PushState {
    session: BrokerSession,
    uri: Option<String>,
    conn: Option<ActiveConn>,
    checkpoint: Option<ItemId>,
    seen: HashSet<ItemId>,
    dismissed: HashSet<ItemId>,
    retry: Option<tokio::task::JoinHandle<()>>,
    lifetime: CancellationToken,
}

/// Client session against the notification broker.
///
/// One instance per logged-in identity; [`PushClient::shutdown`] clears
/// all per-identity session state while the handler registry persists for
/// the process lifetime.
pub struct PushClient {
    dialer: Arc<dyn Dialer>,
    registry: std::sync::RwLock<HandlerRegistry>,
    state: tokio::sync::Mutex<PushState>,
}

impl PushClient {
    /// Create a disconnected push client.
    pub fn new(dialer: Arc<dyn Dialer>, config: PushConfig) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            registry: std::sync::RwLock::new(HandlerRegistry::default()),
            state: tokio::sync::Mutex::new(PushState {
                session: BrokerSession::new(config.backoff),
                uri: None,
                conn: None,
                checkpoint: None,
                seen: HashSet::new(),
                dismissed: HashSet::new(),
                retry: None,
                lifetime: CancellationToken::new(),
            }),
        })
    }

    /// Register a handler for the given categories. Append-only; handlers
    /// are never removed.
    pub fn register_handler(&self, categories: &[Category], handler: Arc<dyn ItemHandler>) {
        self.registry.write().unwrap().register(categories, handler);
    }

    /// True when a live broker session is established.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.session.is_connected()
    }

    /// Current session state.
    pub async fn session_state(&self) -> BrokerState {
        self.state.lock().await.session.state()
    }

    /// Establish a session to the broker at `uri`.
    ///
    /// Items missed since the last acknowledged checkpoint are replayed
    /// and applied idempotently before this returns. At most one attempt
    /// is in flight at a time: a connect while already connecting or
    /// connected is a no-op.
    pub async fn connect(self: &Arc<Self>, ctx: &Context, uri: &str) -> Result<(), PushError> {
        let proceed = {
            let mut st = self.state.lock().await;
            st.uri = Some(uri.to_string());
            let actions = st.session.on_event(BrokerEvent::ConnectRequested);
            match st.session.state() {
                BrokerState::AuthRejected => {
                    return Err(PushError::AuthRejected(
                        "session auth previously rejected; reset required".into(),
                    ))
                }
                _ => actions.contains(&BrokerAction::Dial),
            }
        };
        if !proceed {
            tracing::debug!("broker connect already in flight or established");
            return Ok(());
        }
        self.dial_and_sync(ctx).await
    }

    /// Tear down the current session, preserving registered handlers and
    /// the replay checkpoint, so a fresh connect can follow.
    pub async fn reset(self: &Arc<Self>, _ctx: &Context) {
        let mut st = self.state.lock().await;
        let actions = st.session.on_event(BrokerEvent::ResetRequested);
        self.run_actions(&mut st, actions).await;
    }

    /// Logout teardown: close the session and drop all per-identity
    /// state. The handler registry survives.
    pub async fn shutdown(self: &Arc<Self>, ctx: &Context) {
        self.reset(ctx).await;
        let mut st = self.state.lock().await;
        st.lifetime.cancel();
        st.lifetime = CancellationToken::new();
        st.uri = None;
        st.checkpoint = None;
        st.seen.clear();
        st.dismissed.clear();
    }

    /// Ask the broker to synthesize and store a new item.
    pub async fn inject_item(
        &self,
        ctx: &Context,
        category: Category,
        body: Vec<u8>,
    ) -> Result<ItemId, PushError> {
        let client = self.live_client().await?;
        let res: InjectRes = client
            .call(ctx, "broker.injectItem", &InjectArgs { category, body })
            .await?;
        Ok(res.id)
    }

    /// Acknowledge an item so it is removed from future replay.
    ///
    /// Idempotent: dismissing an already-dismissed id is a no-op, never an
    /// error.
    pub async fn dismiss_item(&self, ctx: &Context, id: ItemId) -> Result<(), PushError> {
        let client = {
            let st = self.state.lock().await;
            if st.dismissed.contains(&id) {
                tracing::debug!(%id, "item already dismissed");
                return Ok(());
            }
            match &st.conn {
                Some(conn) => conn.client.clone(),
                None => return Err(PushError::NotConnected),
            }
        };
        client
            .call::<_, ()>(ctx, "broker.dismissItem", &DismissArgs { id })
            .await?;
        self.state.lock().await.dismissed.insert(id);
        Ok(())
    }

    /// Send an out-of-band message through the broker. Fire-and-forget.
    pub async fn inject_oobm(
        &self,
        ctx: &Context,
        system: &str,
        body: Vec<u8>,
    ) -> Result<(), PushError> {
        let client = self.live_client().await?;
        client
            .notify(
                ctx,
                "broker.oobm",
                &OobmArgs {
                    system: system.to_string(),
                    body,
                },
            )
            .await?;
        Ok(())
    }

    /// The RPC client of the live broker session, if any.
    ///
    /// The deliverer's sender posts messages over this shared connection;
    /// callers must tolerate `None` while offline.
    pub async fn remote_client(&self) -> Option<RpcClient> {
        let st = self.state.lock().await;
        st.conn.as_ref().map(|conn| conn.client.clone())
    }

    async fn live_client(&self) -> Result<RpcClient, PushError> {
        let st = self.state.lock().await;
        match &st.conn {
            Some(conn) => Ok(conn.client.clone()),
            None => Err(PushError::NotConnected),
        }
    }

    /// Perform one connection attempt and, on success, apply the replay.
    async fn dial_and_sync(self: &Arc<Self>, ctx: &Context) -> Result<(), PushError> {
        let uri = match self.state.lock().await.uri.clone() {
            Some(uri) => uri,
            None => return Err(PushError::NotConnected),
        };

        match self.try_establish(ctx, &uri).await {
            Ok((conn, replay)) => {
                {
                    let mut st = self.state.lock().await;
                    st.session.on_event(BrokerEvent::ConnectSucceeded);
                    // A reset may have landed while the attempt was in
                    // flight; discard the late connection instead of
                    // resurrecting the session.
                    if !st.session.is_connected() {
                        drop(st);
                        tracing::debug!("session reset during establishment, discarding");
                        conn.dispatcher.shutdown().await;
                        return Err(PushError::NotConnected);
                    }
                    let dispatcher = Arc::clone(&conn.dispatcher);
                    st.conn = Some(conn);
                    // The connection may have died between establishment
                    // and now; the close callback saw a Connecting state
                    // and did nothing, so settle it here.
                    if dispatcher.is_closed() {
                        let actions = st.session.on_event(BrokerEvent::ConnectionLost {
                            error: "closed during establishment".into(),
                        });
                        self.run_actions(&mut st, actions).await;
                        return Err(PushError::Transport(TransportError::Closed));
                    }
                }
                tracing::info!(%uri, replayed = replay.len(), "broker session established");
                for item in replay {
                    self.apply_item(ctx, item).await;
                }
                Ok(())
            }
            Err(err) => {
                let auth_rejected = matches!(err, PushError::AuthRejected(_));
                let mut st = self.state.lock().await;
                let actions = st.session.on_event(BrokerEvent::ConnectFailed {
                    auth_rejected,
                    error: err.to_string(),
                });
                tracing::warn!(%uri, "broker connect failed: {err}");
                self.run_actions(&mut st, actions).await;
                Err(err)
            }
        }
    }

    async fn try_establish(
        self: &Arc<Self>,
        ctx: &Context,
        uri: &str,
    ) -> Result<(ActiveConn, Vec<Item>), PushError> {
        let transport = self.dialer.dial(uri).await?;
        let dispatcher = Dispatcher::new(transport);
        dispatcher.set_incoming(Arc::new(BrokerIncoming {
            client: Arc::downgrade(self),
        }));
        let weak = Arc::downgrade(self);
        dispatcher.set_on_close(Box::new(move |err| {
            if let Some(client) = weak.upgrade() {
                tokio::spawn(async move {
                    client.handle_connection_lost(err).await;
                });
            }
        }));
        dispatcher.start();

        let client =
            RpcClient::new(Arc::clone(&dispatcher)).with_error_unwrapper(broker_unwrapper());

        let checkpoint = self.state.lock().await.checkpoint;
        let synced: Result<SyncRes, RpcError> =
            client.call(ctx, "broker.sync", &SyncArgs { checkpoint }).await;
        match synced {
            Ok(res) => Ok((ActiveConn { client, dispatcher }, res.items)),
            Err(err) => {
                // The transport is up but the session was refused; don't
                // leak its receive loop.
                dispatcher.shutdown().await;
                Err(PushError::from(err))
            }
        }
    }

    /// Apply one broker item: dedup against replay, fan out to the typed
    /// registry, honor dismiss requests.
    async fn apply_item(self: &Arc<Self>, ctx: &Context, item: Item) {
        {
            let mut st = self.state.lock().await;
            if st.dismissed.contains(&item.id) || !st.seen.insert(item.id) {
                tracing::debug!(id = %item.id, "skipping re-delivered item");
                return;
            }
            st.checkpoint = Some(item.id);
        }

        let handlers = self.registry.read().unwrap().handlers_for(item.category);
        if handlers.is_empty() {
            tracing::debug!(category = %item.category, "no handler registered for item");
            return;
        }

        let mut dismiss = false;
        for handler in handlers {
            match handler.handle(ctx, &item).await {
                Ok(Disposition::Dismiss) => dismiss = true,
                Ok(Disposition::Keep) => {}
                Err(err) => {
                    tracing::warn!(
                        handler = handler.name(),
                        id = %item.id,
                        "item handler failed: {err}"
                    );
                }
            }
        }

        if dismiss {
            if let Err(err) = self.dismiss_item(ctx, item.id).await {
                tracing::warn!(id = %item.id, "dismiss after handling failed: {err}");
            }
        }
    }

    async fn handle_connection_lost(self: &Arc<Self>, err: TransportError) {
        let mut st = self.state.lock().await;
        if st.lifetime.is_cancelled() {
            return;
        }
        let actions = st.session.on_event(BrokerEvent::ConnectionLost {
            error: err.to_string(),
        });
        if !actions.is_empty() {
            tracing::warn!("broker session lost: {err}");
        }
        self.run_actions(&mut st, actions).await;
    }

    async fn run_actions(self: &Arc<Self>, st: &mut PushState, actions: Vec<BrokerAction>) {
        for action in actions {
            match action {
                BrokerAction::TearDown => {
                    if let Some(conn) = st.conn.take() {
                        conn.dispatcher.shutdown().await;
                    }
                }
                BrokerAction::ScheduleRetry { delay } => {
                    let weak = Arc::downgrade(self);
                    let lifetime = st.lifetime.clone();
                    tracing::debug!(?delay, "scheduling broker reconnect");
                    st.retry = Some(tokio::spawn(async move {
                        tokio::select! {
                            _ = lifetime.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if let Some(client) = weak.upgrade() {
                            client.retry_connect().await;
                        }
                    }));
                }
                BrokerAction::CancelRetry => {
                    if let Some(task) = st.retry.take() {
                        task.abort();
                    }
                }
                // Dial is only produced for explicit connect requests,
                // which drive the attempt themselves.
                BrokerAction::Dial => {}
            }
        }
    }

    // Returns a boxed, explicitly-`Send` future to break the auto-trait
    // cycle formed by the recursive spawns
    // (run_actions/handle_connection_lost -> retry_connect -> dial_and_sync
    // -> try_establish -> ... -> spawn). Giving the recursive call a
    // concretely-`Send` type stops the compiler from having to introspect
    // an opaque type inside its own defining scope.
    fn retry_connect(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let proceed = {
                let mut st = self.state.lock().await;
                st.session
                    .on_event(BrokerEvent::RetryTimerFired)
                    .contains(&BrokerAction::Dial)
            };
            if proceed {
                let ctx = Context::background();
                // Failure schedules the next retry internally.
                let _ = self.dial_and_sync(&ctx).await;
            }
        })
    }
}

/// Routes broker-pushed frames into the push client.
struct BrokerIncoming {
    client: Weak<PushClient>,
}

#[async_trait]
impl IncomingHandler for BrokerIncoming {
    async fn handle_call(
        &self,
        _ctx: &Context,
        method: &str,
        _arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        Err(WireError::method_not_found(method))
    }

    async fn handle_notify(&self, _ctx: &Context, method: &str, arg: &[u8]) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        match method {
            "broker.item" => match decode_value::<Item>(arg) {
                Ok(item) => {
                    let lifetime = client.state.lock().await.lifetime.clone();
                    let ctx = Context::with_cancel(lifetime.child_token());
                    client.apply_item(&ctx, item).await;
                }
                Err(err) => tracing::warn!("undecodable broker item: {err}"),
            },
            "broker.oobm" => match decode_value::<OobmArgs>(arg) {
                // Out-of-band messages target subsystems outside the sync
                // core; surface them in the log for now.
                Ok(oobm) => tracing::debug!(system = %oobm.system, "out-of-band message"),
                Err(err) => tracing::warn!("undecodable out-of-band message: {err}"),
            },
            other => tracing::debug!(method = other, "ignoring unknown broker notification"),
        }
    }
}

fn broker_unwrapper() -> UnwrapErrorFn {
    Arc::new(|wire: &WireError| {
        if wire.code == codes::AUTH_REJECTED {
            Some(Box::new(BrokerError::AuthRejected(wire.desc.clone()))
                as Box<dyn std::error::Error + Send + Sync>)
        } else {
            None
        }
    })
}
