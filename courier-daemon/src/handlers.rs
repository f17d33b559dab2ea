//! Per-connection protocol handlers.
//!
//! A fresh set of these is registered for every accepted connection; all
//! of them share the process-wide components owned by [`Service`].

use courier_client::{DeliverError, PushClient, PushError, VersionError};
use courier_core::{DeliveryState, OutboxEntry};
use courier_rpc::{Context, ProtocolHandler, ProtocolRegistry, RpcError};
use courier_types::{
    codes, decode_value, encode_value, ConversationId, DismissArgs, InjectArgs, InjectRes,
    OutboxId, ServerCacheVers, Uid, WireError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::service::Service;

/// Argument of `session.login`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginArgs {
    /// Identity to log in.
    pub uid: Uid,
}

/// Argument of `chat.queue`.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueArgs {
    /// Target conversation.
    pub conversation: ConversationId,
    /// Sealed message payload.
    pub payload: Vec<u8>,
}

/// Result of `chat.queue`.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueRes {
    /// Outbox id of the queued message.
    pub outbox_id: OutboxId,
}

/// Argument of `chat.retry`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryArgs {
    /// Failed entry to requeue.
    pub outbox_id: OutboxId,
}

/// One failed entry as reported by `chat.failed`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedEntry {
    /// Outbox id, usable with `chat.retry`.
    pub outbox_id: OutboxId,
    /// Conversation the message was bound for.
    pub conversation: ConversationId,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Why delivery was given up on.
    pub reason: String,
}

impl From<&OutboxEntry> for FailedEntry {
    fn from(entry: &OutboxEntry) -> Self {
        let reason = match &entry.state {
            DeliveryState::Failed { reason } => reason.clone(),
            _ => String::new(),
        };
        Self {
            outbox_id: entry.id,
            conversation: entry.conversation,
            attempts: entry.attempts,
            reason,
        }
    }
}

/// Argument of `chat.matchInbox` / `chat.matchBodies`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchArgs {
    /// The caller-held generation number.
    pub vers: u64,
}

/// Result of `push.status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRes {
    /// True when the broker session is live.
    pub connected: bool,
}

/// Argument of `debug.delayedPing`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DelayArgs {
    /// Milliseconds to wait before answering.
    pub ms: u64,
}

/// Register the full per-connection handler set.
pub fn register_all(
    registry: &mut ProtocolRegistry,
    service: &Arc<Service>,
) -> Result<(), RpcError> {
    registry.register(Arc::new(SessionHandler {
        service: Arc::clone(service),
    }))?;
    registry.register(Arc::new(ChatHandler {
        service: Arc::clone(service),
    }))?;
    registry.register(Arc::new(PushHandler {
        push: Arc::clone(&service.push),
    }))?;
    registry.register(Arc::new(CtlHandler {
        shutdown: service.shutdown_token(),
    }))?;
    registry.register(Arc::new(DebugHandler))?;
    Ok(())
}

fn bad_arg(err: impl std::fmt::Display) -> WireError {
    WireError::invalid_argument(err.to_string())
}

fn internal(err: impl std::fmt::Display) -> WireError {
    WireError::internal(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    encode_value(value).map_err(internal)
}

fn version_error(err: VersionError) -> WireError {
    match err {
        VersionError::Mismatch { expected, actual } => WireError::new(
            codes::VERSION_MISMATCH,
            "VERSION_MISMATCH",
            format!("expected {expected}, server has {actual}"),
        ),
        other => internal(other),
    }
}

fn deliver_error(err: DeliverError) -> WireError {
    match err {
        DeliverError::NotStarted => bad_arg("no active delivery session; log in first"),
        DeliverError::UnknownEntry(id) => bad_arg(format!("unknown outbox entry {id}")),
        other => internal(other),
    }
}

fn push_error(err: PushError) -> WireError {
    match err {
        PushError::NotConnected => internal("no broker session"),
        PushError::AuthRejected(desc) => {
            WireError::new(codes::AUTH_REJECTED, "AUTH_REJECTED", desc)
        }
        other => internal(other),
    }
}

/// `session.*`: login/logout and session introspection.
struct SessionHandler {
    service: Arc<Service>,
}

#[async_trait]
impl ProtocolHandler for SessionHandler {
    fn prefix(&self) -> &'static str {
        "session"
    }

    async fn handle(
        &self,
        ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        match method {
            "login" => {
                let args: LoginArgs = decode_value(arg).map_err(bad_arg)?;
                self.service.on_login(ctx, args.uid).await;
                encode(&())
            }
            "logout" => {
                self.service.on_logout(ctx).await;
                encode(&())
            }
            "current" => encode(&self.service.current_uid().await),
            other => Err(WireError::method_not_found(other)),
        }
    }
}

/// `chat.*`: outbox operations and the version cache.
struct ChatHandler {
    service: Arc<Service>,
}

#[async_trait]
impl ProtocolHandler for ChatHandler {
    fn prefix(&self) -> &'static str {
        "chat"
    }

    async fn handle(
        &self,
        ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        let deliverer = &self.service.deliverer;
        let versions = &self.service.versions;
        match method {
            "queue" => {
                let args: QueueArgs = decode_value(arg).map_err(bad_arg)?;
                let outbox_id = deliverer
                    .queue(ctx, args.conversation, args.payload)
                    .await
                    .map_err(deliver_error)?;
                encode(&QueueRes { outbox_id })
            }
            "failed" => {
                let failed = deliverer.failed_entries(ctx).await.map_err(deliver_error)?;
                let entries: Vec<FailedEntry> = failed.iter().map(FailedEntry::from).collect();
                encode(&entries)
            }
            "pending" => {
                let count = deliverer.pending_count(ctx).await.map_err(deliver_error)?;
                encode(&(count as u64))
            }
            "retry" => {
                let args: RetryArgs = decode_value(arg).map_err(bad_arg)?;
                deliverer
                    .retry_failed(ctx, args.outbox_id)
                    .await
                    .map_err(deliver_error)?;
                encode(&())
            }
            "syncVersions" => {
                let vers: ServerCacheVers = decode_value(arg).map_err(bad_arg)?;
                versions.sync(ctx, vers).await.map_err(version_error)?;
                encode(&())
            }
            "fetchVersions" => {
                let vers = versions.fetch(ctx).await.map_err(version_error)?;
                encode(&vers)
            }
            "matchInbox" => {
                let args: MatchArgs = decode_value(arg).map_err(bad_arg)?;
                versions
                    .match_inbox(ctx, args.vers)
                    .await
                    .map_err(version_error)?;
                encode(&())
            }
            "matchBodies" => {
                let args: MatchArgs = decode_value(arg).map_err(bad_arg)?;
                versions
                    .match_bodies(ctx, args.vers)
                    .await
                    .map_err(version_error)?;
                encode(&())
            }
            other => Err(WireError::method_not_found(other)),
        }
    }
}

/// `push.*`: item injection, dismissal, and connection status.
struct PushHandler {
    push: Arc<PushClient>,
}

#[async_trait]
impl ProtocolHandler for PushHandler {
    fn prefix(&self) -> &'static str {
        "push"
    }

    async fn handle(
        &self,
        ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        match method {
            "inject" => {
                let args: InjectArgs = decode_value(arg).map_err(bad_arg)?;
                let id = self
                    .push
                    .inject_item(ctx, args.category, args.body)
                    .await
                    .map_err(push_error)?;
                encode(&InjectRes { id })
            }
            "dismiss" => {
                let args: DismissArgs = decode_value(arg).map_err(bad_arg)?;
                self.push
                    .dismiss_item(ctx, args.id)
                    .await
                    .map_err(push_error)?;
                encode(&())
            }
            "status" => encode(&StatusRes {
                connected: self.push.is_connected().await,
            }),
            other => Err(WireError::method_not_found(other)),
        }
    }
}

/// `ctl.*`: daemon control.
struct CtlHandler {
    shutdown: CancellationToken,
}

#[async_trait]
impl ProtocolHandler for CtlHandler {
    fn prefix(&self) -> &'static str {
        "ctl"
    }

    async fn handle(
        &self,
        _ctx: &Context,
        method: &str,
        _arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        match method {
            "ping" => encode(&"pong"),
            "stop" => {
                tracing::info!("stop requested over ctl protocol");
                // Give the reply frame time to flush before connections
                // are torn down.
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                    shutdown.cancel();
                });
                encode(&())
            }
            other => Err(WireError::method_not_found(other)),
        }
    }
}

/// `debug.*`: diagnostics.
struct DebugHandler;

#[async_trait]
impl ProtocolHandler for DebugHandler {
    fn prefix(&self) -> &'static str {
        "debug"
    }

    async fn handle(
        &self,
        _ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        match method {
            "delayedPing" => {
                let args: DelayArgs = decode_value(arg).map_err(bad_arg)?;
                tokio::time::sleep(std::time::Duration::from_millis(args.ms)).await;
                encode(&"pong")
            }
            other => Err(WireError::method_not_found(other)),
        }
    }
}
