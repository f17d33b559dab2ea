//! # courier-rpc
//!
//! RPC plumbing for courier: one persistent connection carries correlated
//! calls and fire-and-forget notifications as length-prefixed MessagePack
//! frames.
//!
//! ## Architecture
//!
//! ```text
//! RpcClient ──► Dispatcher ──► Transport ──► socket
//!                   ▲
//!                   └── receive loop routes Reply/Error to pending calls
//!                       and Call/Notify to an IncomingHandler
//! ```
//!
//! Every externally invoked operation takes a [`Context`], which carries a
//! cancellation token and correlation tags. Cancelling a call abandons only
//! that call's frame; the connection stays usable.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod context;
mod dispatcher;
mod error;
mod server;
mod transport;

pub use client::{RpcClient, TagsFn, UnwrapErrorFn};
pub use context::Context;
pub use dispatcher::{CloseFn, Dispatcher, IncomingHandler};
pub use error::{RpcError, TransportError};
pub use server::{ProtocolHandler, ProtocolRegistry};
pub use transport::{Dialer, FramedTransport, MockTransport, TcpDialer, Transport};
