//! # courier-core
//!
//! Pure logic for the courier sync core (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping for the push
//! client and the message deliverer without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules here are **pure**: they take input (events, timestamps) and
//! produce output (new state, actions) without side effects. The actual I/O
//! lives in `courier-client`, which interprets the actions these machines
//! produce. Time is passed in as a plain millisecond value so retry
//! schedules can be tested without sleeping.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod outbox;
pub mod session;

pub use backoff::Backoff;
pub use outbox::{DeliveryState, OutboxEntry, OutboxQueue};
pub use session::{BrokerAction, BrokerEvent, BrokerSession, BrokerState};
