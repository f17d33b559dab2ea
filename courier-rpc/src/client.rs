//! Typed call/notify facade over a [`Dispatcher`].

use courier_types::{decode_value, encode_value, WireError};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Context, Dispatcher, RpcError};

/// Pluggable translation of a generic wire error into a richer typed one.
///
/// Returning `None` leaves the generic representation in place.
pub type UnwrapErrorFn =
    Arc<dyn Fn(&WireError) -> Option<Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Pluggable extraction of extra correlation tags from a context.
pub type TagsFn = Arc<dyn Fn(&Context) -> BTreeMap<String, String> + Send + Sync>;

/// Call/notify facade over one dispatcher.
///
/// Attaches correlation tags, encodes arguments, and unwraps wire errors
/// into typed errors through an optional pluggable function.
#[derive(Clone)]
pub struct RpcClient {
    dispatcher: Arc<Dispatcher>,
    unwrap_error: Option<UnwrapErrorFn>,
    tags_fn: Option<TagsFn>,
}

impl RpcClient {
    /// Create a client over the given dispatcher.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            unwrap_error: None,
            tags_fn: None,
        }
    }

    /// Install an error unwrapper.
    pub fn with_error_unwrapper(mut self, f: UnwrapErrorFn) -> Self {
        self.unwrap_error = Some(f);
        self
    }

    /// Install a tag extraction function.
    pub fn with_tags_fn(mut self, f: TagsFn) -> Self {
        self.tags_fn = Some(f);
        self
    }

    /// The dispatcher this client sends through.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Make a correlated call and decode the result.
    ///
    /// Blocks until the response arrives or `ctx` is cancelled; on
    /// cancellation the connection stays usable for later calls.
    pub async fn call<A, R>(&self, ctx: &Context, method: &str, arg: &A) -> Result<R, RpcError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        if method.is_empty() {
            return Err(RpcError::InvalidArgument("empty method name".into()));
        }

        let mut tags = ctx.tags().clone();
        if let Some(f) = &self.tags_fn {
            tags.extend(f(ctx));
        }

        let arg = encode_value(arg)?;
        match self.dispatcher.call_raw(ctx, method, arg, tags).await {
            Ok(bytes) => Ok(decode_value(&bytes)?),
            Err(RpcError::Server(wire)) => Err(self.unwrap(wire)),
            Err(other) => Err(other),
        }
    }

    /// Send a notification; returns once the frame is flushed locally.
    ///
    /// Remote-side processing errors are never surfaced.
    pub async fn notify<A>(&self, ctx: &Context, method: &str, arg: &A) -> Result<(), RpcError>
    where
        A: Serialize + Sync,
    {
        if method.is_empty() {
            return Err(RpcError::InvalidArgument("empty method name".into()));
        }
        let arg = encode_value(arg)?;
        self.dispatcher.notify_raw(ctx, method, arg).await
    }

    fn unwrap(&self, wire: WireError) -> RpcError {
        if let Some(f) = &self.unwrap_error {
            if let Some(err) = f(&wire) {
                return RpcError::App(err);
            }
        }
        RpcError::Server(wire)
    }
}
