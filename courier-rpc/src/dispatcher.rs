//! Per-connection frame dispatcher.
//!
//! One [`Dispatcher`] owns one transport. Outgoing calls are correlated by
//! sequence number through a concurrent pending table; a spawned receive
//! loop routes `Reply`/`Error` frames back to their callers and hands
//! `Call`/`Notify` frames to an optional [`IncomingHandler`].
//!
//! Cancelling a call removes its pending entry and returns; the connection
//! is left intact and the eventual late response is discarded by the
//! receive loop.

use async_trait::async_trait;
use courier_types::{Frame, WireError};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::{Context, RpcError, Transport, TransportError};

/// Receives calls and notifications pushed by the remote side.
#[async_trait]
pub trait IncomingHandler: Send + Sync {
    /// Handle a correlated call; the returned bytes become the Reply.
    async fn handle_call(
        &self,
        ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError>;

    /// Handle a fire-and-forget notification.
    async fn handle_notify(&self, ctx: &Context, method: &str, arg: &[u8]);
}

type PendingMap = DashMap<u64, oneshot::Sender<Result<Vec<u8>, WireError>>>;

/// Teardown callback invoked exactly once when a connection ends.
pub type CloseFn = Box<dyn FnOnce(TransportError) + Send>;

/// Frames and routes calls/notifications over one persistent connection.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    next_seq: AtomicU64,
    pending: Arc<PendingMap>,
    incoming: Mutex<Option<Arc<dyn IncomingHandler>>>,
    on_close: Mutex<Option<CloseFn>>,
    closed: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher over the given transport.
    ///
    /// Call [`Dispatcher::start`] to begin routing incoming frames.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            next_seq: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
            incoming: Mutex::new(None),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Register the handler for remote-initiated calls/notifications.
    ///
    /// Must be called before [`Dispatcher::start`] to guarantee no frame
    /// is dropped.
    pub fn set_incoming(&self, handler: Arc<dyn IncomingHandler>) {
        *self.incoming.lock().unwrap() = Some(handler);
    }

    /// Register a teardown callback, invoked exactly once when the receive
    /// loop exits for any reason.
    pub fn set_on_close(&self, f: CloseFn) {
        *self.on_close.lock().unwrap() = Some(f);
    }

    /// Spawn the receive loop.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.receive_loop().await;
        });
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// True once the connection has failed or been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue a correlated call with pre-encoded argument bytes.
    ///
    /// Blocks until the response frame arrives or `ctx` is cancelled. On
    /// cancellation the pending entry is dropped and the connection stays
    /// usable for subsequent calls.
    pub async fn call_raw(
        &self,
        ctx: &Context,
        method: &str,
        arg: Vec<u8>,
        tags: BTreeMap<String, String>,
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Transport(TransportError::Closed));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        let frame = Frame::Call {
            seq,
            method: method.to_string(),
            arg,
            tags,
        };
        if let Err(err) = self.transport.send(frame).await {
            self.pending.remove(&seq);
            return Err(err.into());
        }

        tokio::select! {
            _ = ctx.cancelled() => {
                // Abandon the in-flight frame only; the receive loop will
                // discard the late response.
                self.pending.remove(&seq);
                Err(RpcError::Cancelled {
                    method: method.to_string(),
                })
            }
            response = rx => match response {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(wire)) => Err(RpcError::Server(wire)),
                Err(_) => Err(RpcError::Transport(TransportError::Closed)),
            }
        }
    }

    /// Send a fire-and-forget notification with pre-encoded argument
    /// bytes. Returns once the frame is flushed locally.
    pub async fn notify_raw(
        &self,
        _ctx: &Context,
        method: &str,
        arg: Vec<u8>,
    ) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Transport(TransportError::Closed));
        }
        let frame = Frame::Notify {
            method: method.to_string(),
            arg,
        };
        self.transport.send(frame).await?;
        Ok(())
    }

    /// Close the connection and fail all pending calls.
    pub async fn shutdown(&self) {
        let _ = self.transport.close().await;
        self.finish(TransportError::Closed);
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv().await {
                Ok(frame) => self.route(frame),
                Err(err) => {
                    tracing::debug!("dispatcher receive loop ending: {err}");
                    self.finish(err);
                    return;
                }
            }
        }
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Reply { seq, result } => match self.pending.remove(&seq) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(result));
                }
                None => tracing::debug!(seq, "discarding reply for abandoned call"),
            },
            Frame::Error { seq, error } => match self.pending.remove(&seq) {
                Some((_, tx)) => {
                    let _ = tx.send(Err(error));
                }
                None => tracing::debug!(seq, "discarding error for abandoned call"),
            },
            Frame::Call {
                seq,
                method,
                arg,
                tags,
            } => {
                let handler = self.incoming.lock().unwrap().clone();
                let transport = Arc::clone(&self.transport);
                // Each served call runs on its own task so a slow handler
                // cannot stall the receive loop.
                tokio::spawn(async move {
                    let ctx = Context::background().with_tags(tags);
                    let outcome = match handler {
                        Some(h) => h.handle_call(&ctx, &method, &arg).await,
                        None => Err(WireError::method_not_found(&method)),
                    };
                    let frame = match outcome {
                        Ok(result) => Frame::Reply { seq, result },
                        Err(error) => Frame::Error { seq, error },
                    };
                    if let Err(err) = transport.send(frame).await {
                        tracing::debug!(%method, "failed to send reply: {err}");
                    }
                });
            }
            Frame::Notify { method, arg } => {
                if let Some(handler) = self.incoming.lock().unwrap().clone() {
                    tokio::spawn(async move {
                        let ctx = Context::background();
                        handler.handle_notify(&ctx, &method, &arg).await;
                    });
                } else {
                    tracing::debug!(%method, "dropping notification with no handler");
                }
            }
        }
    }

    /// Mark closed, fail every pending call, run the close callback once.
    fn finish(&self, err: TransportError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for seq in keys {
            if let Some((_, tx)) = self.pending.remove(&seq) {
                let _ = tx.send(Err(WireError::internal("connection closed")));
            }
        }
        if let Some(f) = self.on_close.lock().unwrap().take() {
            f(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockTransport;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn started(transport: &MockTransport) -> Arc<Dispatcher> {
        let d = Dispatcher::new(Arc::new(transport.clone()));
        d.start();
        d
    }

    /// Answer the next sent Call frame with a Reply carrying `result`.
    async fn answer_next_call(transport: &MockTransport, result: Vec<u8>) {
        match transport.next_sent().await {
            Frame::Call { seq, .. } => transport.push_incoming(Frame::Reply { seq, result }),
            other => panic!("expected Call frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_roundtrips() {
        let transport = MockTransport::new();
        let dispatcher = started(&transport);

        let t = transport.clone();
        tokio::spawn(async move { answer_next_call(&t, vec![9, 9]).await });

        let result = dispatcher
            .call_raw(&Context::background(), "ctl.ping", vec![], BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result, vec![9, 9]);
    }

    #[tokio::test]
    async fn error_frame_surfaces_as_server_error() {
        let transport = MockTransport::new();
        let dispatcher = started(&transport);

        let t = transport.clone();
        tokio::spawn(async move {
            match t.next_sent().await {
                Frame::Call { seq, .. } => t.push_incoming(Frame::Error {
                    seq,
                    error: WireError::invalid_argument("bad uid"),
                }),
                other => panic!("expected Call, got {other:?}"),
            }
        });

        let err = dispatcher
            .call_raw(&Context::background(), "session.login", vec![], BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            RpcError::Server(wire) => assert_eq!(wire.name, "INVALID_ARGUMENT"),
            other => panic!("expected Server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_abandons_only_that_call() {
        let transport = MockTransport::new();
        let dispatcher = started(&transport);

        let token = CancellationToken::new();
        let ctx = Context::with_cancel(token.clone());

        let d = Arc::clone(&dispatcher);
        let pending = tokio::spawn(async move {
            d.call_raw(&ctx, "chat.queue", vec![], BTreeMap::new()).await
        });

        // Let the Call frame go out, then cancel instead of answering.
        let sent = transport.next_sent().await;
        let cancelled_seq = match &sent {
            Frame::Call { seq, .. } => *seq,
            other => panic!("expected Call, got {other:?}"),
        };
        token.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("cancellation must resolve within bounded time")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));

        // The late reply for the abandoned call is discarded...
        transport.push_incoming(Frame::Reply {
            seq: cancelled_seq,
            result: vec![1],
        });

        // ...and the connection remains usable for the next call.
        let t = transport.clone();
        tokio::spawn(async move { answer_next_call(&t, vec![7]).await });
        let result = dispatcher
            .call_raw(&Context::background(), "ctl.ping", vec![], BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(result, vec![7]);
    }

    #[tokio::test]
    async fn remote_close_fails_pending_calls() {
        let transport = MockTransport::new();
        let dispatcher = started(&transport);

        let d = Arc::clone(&dispatcher);
        let pending = tokio::spawn(async move {
            d.call_raw(&Context::background(), "ctl.ping", vec![], BTreeMap::new())
                .await
        });
        transport.next_sent().await;
        transport.close_remote();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Server(_) | RpcError::Transport(_)));
        assert!(dispatcher.is_closed());
    }

    #[tokio::test]
    async fn close_callback_runs_exactly_once() {
        let transport = MockTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        dispatcher.set_on_close(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        dispatcher.start();

        transport.close_remote();
        // Shutdown after the remote close must not re-run the callback.
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.shutdown().await;
        dispatcher.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notify_flushes_without_waiting() {
        let transport = MockTransport::new();
        let dispatcher = started(&transport);
        dispatcher
            .notify_raw(&Context::background(), "broker.oobm", vec![4])
            .await
            .unwrap();
        assert!(matches!(
            transport.next_sent().await,
            Frame::Notify { method, .. } if method == "broker.oobm"
        ));
    }

    #[tokio::test]
    async fn incoming_call_is_served() {
        struct Echo;
        #[async_trait]
        impl IncomingHandler for Echo {
            async fn handle_call(
                &self,
                _ctx: &Context,
                method: &str,
                arg: &[u8],
            ) -> Result<Vec<u8>, WireError> {
                if method == "debug.echo" {
                    Ok(arg.to_vec())
                } else {
                    Err(WireError::method_not_found(method))
                }
            }
            async fn handle_notify(&self, _ctx: &Context, _method: &str, _arg: &[u8]) {}
        }

        let transport = MockTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        dispatcher.set_incoming(Arc::new(Echo));
        dispatcher.start();

        transport.push_incoming(Frame::Call {
            seq: 42,
            method: "debug.echo".into(),
            arg: vec![5, 6],
            tags: BTreeMap::new(),
        });

        match transport.next_sent().await {
            Frame::Reply { seq, result } => {
                assert_eq!(seq, 42);
                assert_eq!(result, vec![5, 6]);
            }
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn incoming_call_without_handler_errors() {
        let transport = MockTransport::new();
        let dispatcher = Dispatcher::new(Arc::new(transport.clone()));
        dispatcher.start();

        transport.push_incoming(Frame::Call {
            seq: 1,
            method: "nope".into(),
            arg: vec![],
            tags: BTreeMap::new(),
        });

        match transport.next_sent().await {
            Frame::Error { seq, error } => {
                assert_eq!(seq, 1);
                assert_eq!(error.code, courier_types::codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected Error, got {other:?}"),
        }
        // The connection itself stays up.
        assert!(!dispatcher.is_closed());
    }
}
