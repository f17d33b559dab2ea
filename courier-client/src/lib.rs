//! # courier-client
//!
//! The sync engine of courier: everything that keeps a local chat cache
//! consistent with the remote service while the daemon is running.
//!
//! - [`PushClient`] - live session to the notification broker, fanning
//!   incoming items out to registered handlers
//! - [`ServerVersions`] - server-declared cache generation tracking
//! - [`Deliverer`] - durable, per-conversation-ordered outgoing message
//!   queue with retry
//! - [`KvStore`] - the get/put contract this crate consumes for persisted
//!   state (the storage engine itself lives elsewhere)
//!
//! Components declare their collaborators (store, clock, sender, dialer)
//! as explicit constructor arguments instead of reaching into a process
//! global.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
mod deliverer;
mod push;
mod store;
mod versions;

pub use clock::{Clock, MonotonicClock};
pub use deliverer::{
    Deliverer, DelivererConfig, DeliverError, MessageSender, SendFailure,
};
pub use push::{BrokerError, Disposition, ItemHandler, PushClient, PushConfig, PushError};
pub use store::{FileStore, KvStore, MemoryStore, StoreError};
pub use versions::{ServerVersions, VersionError};
