//! # courier-daemon
//!
//! The daemon that owns the courier sync core:
//! - acquires the exclusive single-instance lock
//! - binds one local listening endpoint
//! - gives every accepted connection its own dispatcher and protocol
//!   handlers, all sharing the process-wide push client, deliverer, and
//!   version cache
//! - sequences component startup/teardown on login and logout
//!
//! ## Protocols served per connection
//!
//! - `session` - login/logout/current
//! - `chat` - outbox queueing, failed-entry inspection, version cache ops
//! - `push` - item inject/dismiss, connection status
//! - `ctl` - ping/stop
//! - `debug` - diagnostics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod handlers;
pub mod lock;
pub mod maintenance;
pub mod service;

pub use config::Config;
pub use lock::{InstanceLock, LockError};
pub use service::{Service, ServiceError};
