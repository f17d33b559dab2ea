//! Broker connection state machine.
//!
//! A pure, side-effect-free state machine for the push client's session
//! lifecycle. It takes events as input and produces actions to execute;
//! the actual dialing, teardown, and timers are performed by
//! `courier-client`, which interprets the actions. This keeps reconnect
//! policy unit-testable without network mocks.

use std::time::Duration;

use crate::Backoff;

/// Connection states of the broker session.
///
/// `AuthRejected` is terminal until the session is reset at the next
/// login; network failures pass through `Disconnected` and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// No session and no attempt in flight.
    Disconnected,
    /// Exactly one connection attempt in flight.
    Connecting,
    /// Live session established.
    Connected,
    /// Credentials rejected; no retry until the next login.
    AuthRejected,
}

/// Events fed into the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Caller asked for a connection.
    ConnectRequested,
    /// The in-flight attempt succeeded.
    ConnectSucceeded,
    /// The in-flight attempt failed.
    ConnectFailed {
        /// True when the broker rejected the session credentials.
        auth_rejected: bool,
        /// Description of the failure.
        error: String,
    },
    /// An established session dropped.
    ConnectionLost {
        /// Description of the failure.
        error: String,
    },
    /// The scheduled retry timer fired.
    RetryTimerFired,
    /// Caller asked for a teardown that preserves handlers.
    ResetRequested,
}

/// Actions the caller must execute after an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAction {
    /// Establish a transport to the broker.
    Dial,
    /// Arm the retry timer.
    ScheduleRetry {
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Disarm any pending retry timer.
    CancelRetry,
    /// Close the current transport, if any.
    TearDown,
}

/// The push client's session state machine.
///
/// Guarantees at most one outstanding connection attempt: a
/// `ConnectRequested` while `Connecting` or `Connected` produces no
/// actions.
#[derive(Debug, Clone)]
pub struct BrokerSession {
    state: BrokerState,
    attempt: u32,
    backoff: Backoff,
}

impl BrokerSession {
    /// Create a session machine in the `Disconnected` state.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: BrokerState::Disconnected,
            attempt: 0,
            backoff,
        }
    }

    /// Current state.
    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// True when a live session is established.
    pub fn is_connected(&self) -> bool {
        self.state == BrokerState::Connected
    }

    /// Number of consecutive failed attempts since the last success.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Process an event, returning the actions to execute.
    pub fn on_event(&mut self, event: BrokerEvent) -> Vec<BrokerAction> {
        use BrokerEvent::*;
        use BrokerState::*;

        match (self.state, event) {
            (Disconnected, ConnectRequested) | (Disconnected, RetryTimerFired) => {
                self.state = Connecting;
                vec![BrokerAction::Dial]
            }

            (Connecting, ConnectSucceeded) => {
                self.state = Connected;
                self.attempt = 0;
                vec![]
            }
            (Connecting, ConnectFailed { auth_rejected, .. }) => {
                if auth_rejected {
                    self.state = AuthRejected;
                    vec![BrokerAction::TearDown]
                } else {
                    self.state = Disconnected;
                    self.attempt = self.attempt.saturating_add(1);
                    vec![BrokerAction::ScheduleRetry {
                        delay: self.backoff.delay(self.attempt),
                    }]
                }
            }

            (Connected, ConnectionLost { .. }) => {
                self.state = Disconnected;
                self.attempt = 1;
                vec![
                    BrokerAction::TearDown,
                    BrokerAction::ScheduleRetry {
                        delay: self.backoff.delay(1),
                    },
                ]
            }

            (_, ResetRequested) => {
                let was = self.state;
                self.state = Disconnected;
                self.attempt = 0;
                match was {
                    Connected | Connecting => {
                        vec![BrokerAction::CancelRetry, BrokerAction::TearDown]
                    }
                    _ => vec![BrokerAction::CancelRetry],
                }
            }

            // Everything else: duplicate requests, stale timers, events for
            // a state we already left. Stay put, do nothing.
            (_, _) => vec![],
        }
    }
}
