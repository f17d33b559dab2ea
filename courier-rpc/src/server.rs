//! Per-connection protocol registry.
//!
//! The daemon registers one [`ProtocolHandler`] per method prefix on each
//! accepted connection; the registry implements [`IncomingHandler`] by
//! splitting `prefix.method` and routing to the owning handler.

use async_trait::async_trait;
use courier_types::WireError;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Context, IncomingHandler, RpcError};

/// One protocol served on a connection, e.g. the `chat` methods.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The method prefix this handler owns.
    fn prefix(&self) -> &'static str;

    /// Handle `<prefix>.<method>`; `method` is the part after the dot.
    async fn handle(
        &self,
        ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError>;

    /// Handle a notification addressed to this prefix. Default: drop it.
    async fn handle_notify(&self, _ctx: &Context, _method: &str, _arg: &[u8]) {}
}

/// Routes incoming frames to protocol handlers by method prefix.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol; registering the same prefix twice is an error.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) -> Result<(), RpcError> {
        let prefix = handler.prefix();
        if self.handlers.contains_key(prefix) {
            return Err(RpcError::InvalidArgument(format!(
                "protocol {prefix} already registered"
            )));
        }
        self.handlers.insert(prefix, handler);
        Ok(())
    }

    /// Registered prefixes, in order.
    pub fn prefixes(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    fn resolve<'a>(&self, method: &'a str) -> Option<(&Arc<dyn ProtocolHandler>, &'a str)> {
        let (prefix, rest) = method.split_once('.')?;
        let handler = self.handlers.get(prefix)?;
        Some((handler, rest))
    }
}

#[async_trait]
impl IncomingHandler for ProtocolRegistry {
    async fn handle_call(
        &self,
        ctx: &Context,
        method: &str,
        arg: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        match self.resolve(method) {
            Some((handler, rest)) => handler.handle(ctx, rest, arg).await,
            None => Err(WireError::method_not_found(method)),
        }
    }

    async fn handle_notify(&self, ctx: &Context, method: &str, arg: &[u8]) {
        match self.resolve(method) {
            Some((handler, rest)) => handler.handle_notify(ctx, rest, arg).await,
            None => tracing::debug!(method, "dropping notification for unknown protocol"),
        }
    }
}
