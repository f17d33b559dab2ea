//! Outbox bookkeeping for the message deliverer.
//!
//! A per-conversation FIFO of not-yet-delivered messages. This module owns
//! ordering and retry scheduling only; the deliverer in `courier-client`
//! performs the actual sends and persistence.
//!
//! Ordering rules:
//! - entries in one conversation are attempted strictly in enqueue order;
//! - a retrying entry stays at the head of its conversation and blocks
//!   later entries there, but conversations never block each other;
//! - a permanently failed entry is moved aside so the next entry of that
//!   conversation can proceed.
//!
//! Time is a plain millisecond value supplied by the caller, so retry
//! schedules are testable without sleeping.

use courier_types::{ConversationId, OutboxId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Delivery state of one outbox entry.
///
/// The payload is immutable; only this state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Waiting to be attempted (possibly not before a retry time).
    Pending,
    /// Claimed by the drain loop; an attempt is in flight.
    Sending,
    /// Permanently failed; kept for user inspection and manual retry.
    Failed {
        /// Why delivery was given up on.
        reason: String,
    },
}

/// An outgoing message bound to one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Unique id of this entry.
    pub id: OutboxId,
    /// Conversation the message belongs to.
    pub conversation: ConversationId,
    /// Sealed message payload; opaque to the deliverer.
    pub payload: Vec<u8>,
    /// Current delivery state.
    pub state: DeliveryState,
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest time (caller-clock millis) the next attempt may run.
    pub retry_at_ms: u64,
}

impl OutboxEntry {
    /// Create a fresh pending entry.
    pub fn new(conversation: ConversationId, payload: Vec<u8>) -> Self {
        Self {
            id: OutboxId::new(),
            conversation,
            payload,
            state: DeliveryState::Pending,
            attempts: 0,
            retry_at_ms: 0,
        }
    }
}

/// Per-conversation FIFO queues plus the permanently-failed list.
#[derive(Debug, Default)]
pub struct OutboxQueue {
    queues: BTreeMap<ConversationId, VecDeque<OutboxEntry>>,
    failed: Vec<OutboxEntry>,
}

impl OutboxQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from a persisted snapshot.
    ///
    /// Enqueue order within a conversation is the snapshot order.
    pub fn restore(entries: Vec<OutboxEntry>) -> Self {
        let mut queue = Self::new();
        for entry in entries {
            match entry.state {
                DeliveryState::Failed { .. } => queue.failed.push(entry),
                _ => queue.enqueue(entry),
            }
        }
        queue
    }

    /// Append an entry to the tail of its conversation.
    pub fn enqueue(&mut self, mut entry: OutboxEntry) {
        entry.state = DeliveryState::Pending;
        self.queues
            .entry(entry.conversation)
            .or_default()
            .push_back(entry);
    }

    /// Claim the next deliverable entry, marking it `Sending`.
    ///
    /// An entry is deliverable when it is the head of its conversation,
    /// `Pending`, and past its retry time. Conversations whose head is
    /// claimed or still backing off are skipped; later entries behind a
    /// blocked head are never returned.
    pub fn next_ready(&mut self, now_ms: u64) -> Option<OutboxEntry> {
        for queue in self.queues.values_mut() {
            if let Some(head) = queue.front_mut() {
                if head.state == DeliveryState::Pending && head.retry_at_ms <= now_ms {
                    head.state = DeliveryState::Sending;
                    return Some(head.clone());
                }
            }
        }
        None
    }

    /// Record a successful delivery; the entry is removed.
    pub fn mark_sent(&mut self, id: OutboxId) -> bool {
        self.remove(id).is_some()
    }

    /// Record a transient failure; the entry returns to the head of its
    /// conversation and blocks it until `retry_at_ms`.
    pub fn mark_retry(&mut self, id: OutboxId, retry_at_ms: u64) -> bool {
        for queue in self.queues.values_mut() {
            if let Some(head) = queue.front_mut() {
                if head.id == id {
                    head.state = DeliveryState::Pending;
                    head.attempts = head.attempts.saturating_add(1);
                    head.retry_at_ms = retry_at_ms;
                    return true;
                }
            }
        }
        false
    }

    /// Record a permanent failure; the entry moves to the failed list and
    /// the next entry of that conversation is unblocked.
    pub fn mark_failed(&mut self, id: OutboxId, reason: impl Into<String>) -> bool {
        match self.remove(id) {
            Some(mut entry) => {
                entry.state = DeliveryState::Failed {
                    reason: reason.into(),
                };
                entry.attempts = entry.attempts.saturating_add(1);
                self.failed.push(entry);
                true
            }
            None => false,
        }
    }

    /// Requeue a permanently failed entry at the tail of its conversation
    /// (user-requested retry). Attempt count starts over.
    pub fn retry_failed(&mut self, id: OutboxId) -> bool {
        match self.failed.iter().position(|e| e.id == id) {
            Some(idx) => {
                let mut entry = self.failed.remove(idx);
                entry.attempts = 0;
                entry.retry_at_ms = 0;
                self.enqueue(entry);
                true
            }
            None => false,
        }
    }

    /// Permanently failed entries, oldest first.
    pub fn failed(&self) -> &[OutboxEntry] {
        &self.failed
    }

    /// The earliest retry time among blocked heads, if every deliverable
    /// head is waiting on one.
    ///
    /// `None` means either some head is ready now or there is nothing
    /// queued; callers distinguish via [`OutboxQueue::pending_len`].
    pub fn next_wake_ms(&self, now_ms: u64) -> Option<u64> {
        let mut earliest = None;
        for queue in self.queues.values() {
            if let Some(head) = queue.front() {
                if head.state == DeliveryState::Pending {
                    if head.retry_at_ms <= now_ms {
                        return None;
                    }
                    earliest = Some(match earliest {
                        Some(e) if e < head.retry_at_ms => e,
                        _ => head.retry_at_ms,
                    });
                }
            }
        }
        earliest
    }

    /// Number of entries still queued (pending or claimed).
    pub fn pending_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// True when nothing is queued for delivery.
    pub fn is_idle(&self) -> bool {
        self.pending_len() == 0
    }

    /// All entries in persistable form: queued entries (in order, claimed
    /// ones reverted to `Pending` with their retry time cleared) followed
    /// by the failed list.
    pub fn snapshot(&self) -> Vec<OutboxEntry> {
        let mut out = Vec::with_capacity(self.pending_len() + self.failed.len());
        for queue in self.queues.values() {
            for entry in queue {
                let mut entry = entry.clone();
                if entry.state == DeliveryState::Sending {
                    entry.state = DeliveryState::Pending;
                }
                entry.retry_at_ms = 0;
                out.push(entry);
            }
        }
        out.extend(self.failed.iter().cloned());
        out
    }

    fn remove(&mut self, id: OutboxId) -> Option<OutboxEntry> {
        let mut removed = None;
        let mut empty_conv = None;
        for (conv, queue) in self.queues.iter_mut() {
            if let Some(idx) = queue.iter().position(|e| e.id == id) {
                removed = queue.remove(idx);
                if queue.is_empty() {
                    empty_conv = Some(*conv);
                }
                break;
            }
        }
        if let Some(conv) = empty_conv {
            self.queues.remove(&conv);
        }
        removed
    }
}
