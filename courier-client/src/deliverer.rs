//! Durable, ordered, retrying outbox for outgoing messages.
//!
//! One [`Deliverer`] instance serves one logged-in identity at a time.
//! Entries are persisted through the [`KvStore`] on every state change, so
//! a stop/start cycle (or daemon restart) resumes draining previously
//! queued entries exactly once each. Ordering and retry bookkeeping live
//! in `courier_core::outbox`; this module owns the drain task, the
//! persistence, and the [`MessageSender`] collaborator that seals and
//! transmits each payload.

use courier_core::{Backoff, OutboxEntry, OutboxQueue};
use courier_rpc::Context;
use courier_types::{decode_value, encode_value, CodecError, ConversationId, OutboxId, Uid};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::{Clock, KvStore, MonotonicClock, StoreError};

const OUTBOX_TABLE: &str = "outbox";

/// Classified failure from a send attempt.
///
/// The sender (which owns signing/encryption and the wire call) decides
/// the class: network trouble and timeouts are transient, a server
/// rejection or unavailable key is permanent. The deliverer additionally
/// reclassifies an entry as permanent once its transient attempts exhaust
/// the configured cap.
#[derive(Debug, Error)]
pub enum SendFailure {
    /// Worth retrying with backoff.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Retrying cannot help; surface to the user.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// Transmits one sealed message to the service.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Attempt delivery of `payload` to `conversation`.
    async fn send(
        &self,
        ctx: &Context,
        conversation: ConversationId,
        payload: &[u8],
    ) -> Result<(), SendFailure>;
}

/// Deliverer errors.
#[derive(Debug, Error)]
pub enum DeliverError {
    /// Operation requires a started deliverer.
    #[error("deliverer not started")]
    NotStarted,

    /// No failed entry with the given id.
    #[error("unknown outbox entry {0}")]
    UnknownEntry(OutboxId),

    /// Outbox persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Outbox snapshot failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Deliverer configuration.
#[derive(Debug, Clone)]
pub struct DelivererConfig {
    /// Retry backoff curve for transient failures.
    pub backoff: Backoff,
    /// Transient attempts before an entry is reclassified permanent.
    pub max_attempts: u32,
}

impl Default for DelivererConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_attempts: 5,
        }
    }
}

struct Active {
    uid: Uid,
    queue: Arc<std::sync::Mutex<OutboxQueue>>,
    wake: Arc<tokio::sync::Notify>,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Durable ordered outbox with retry.
pub struct Deliverer {
    sender: Arc<dyn MessageSender>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: DelivererConfig,
    active: tokio::sync::Mutex<Option<Active>>,
}

impl Deliverer {
    /// Create a stopped deliverer.
    pub fn new(
        sender: Arc<dyn MessageSender>,
        store: Arc<dyn KvStore>,
        config: DelivererConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sender,
            store,
            clock: Arc::new(MonotonicClock::new()),
            config,
            active: tokio::sync::Mutex::new(None),
        })
    }

    /// True when a drain loop is running.
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Activate delivery for `uid`.
    ///
    /// Idempotent for the same identity. Starting for a different
    /// identity stops the previous loop and loads the new identity's
    /// persisted queue.
    pub async fn start(self: &Arc<Self>, _ctx: &Context, uid: Uid) -> Result<(), DeliverError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.uid == uid {
                tracing::debug!(%uid, "deliverer already started");
                return Ok(());
            }
        }
        if let Some(previous) = active.take() {
            tracing::info!(old = %previous.uid, new = %uid, "switching deliverer identity");
            Self::halt(previous).await;
        }

        let queue = match self.store.get(OUTBOX_TABLE, &store_key(uid)).await? {
            Some(raw) => OutboxQueue::restore(decode_value(&raw)?),
            None => OutboxQueue::new(),
        };
        let resumed = queue.pending_len();
        if resumed > 0 {
            tracing::info!(%uid, resumed, "resuming persisted outbox entries");
        }

        let queue = Arc::new(std::sync::Mutex::new(queue));
        let wake = Arc::new(tokio::sync::Notify::new());
        let stop = CancellationToken::new();
        let task = tokio::spawn(drain_loop(DrainHandles {
            sender: Arc::clone(&self.sender),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            uid,
            queue: Arc::clone(&queue),
            wake: Arc::clone(&wake),
            stop: stop.clone(),
        }));

        *active = Some(Active {
            uid,
            queue,
            wake,
            stop,
            task,
        });
        wake_if_some(&active);
        Ok(())
    }

    /// Halt the drain loop without discarding queued entries; they
    /// persist for the next start.
    pub async fn stop(&self, _ctx: &Context) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        tracing::info!(uid = %active.uid, "stopping deliverer");
        Self::halt(active).await;
    }

    /// Queue a message for delivery; returns its outbox id.
    pub async fn queue(
        &self,
        _ctx: &Context,
        conversation: ConversationId,
        payload: Vec<u8>,
    ) -> Result<OutboxId, DeliverError> {
        let (uid, queue, wake) = self.handles().await?;
        let entry = OutboxEntry::new(conversation, payload);
        let id = entry.id;
        {
            queue.lock().unwrap().enqueue(entry);
        }
        persist_queue(&self.store, uid, &queue).await?;
        wake.notify_one();
        Ok(id)
    }

    /// Entries that failed permanently, for user inspection.
    pub async fn failed_entries(&self, _ctx: &Context) -> Result<Vec<OutboxEntry>, DeliverError> {
        let (_, queue, _) = self.handles().await?;
        let failed = queue.lock().unwrap().failed().to_vec();
        Ok(failed)
    }

    /// Number of entries still queued for delivery.
    pub async fn pending_count(&self, _ctx: &Context) -> Result<usize, DeliverError> {
        let (_, queue, _) = self.handles().await?;
        let count = queue.lock().unwrap().pending_len();
        Ok(count)
    }

    /// Requeue a permanently failed entry (user-requested retry).
    pub async fn retry_failed(&self, _ctx: &Context, id: OutboxId) -> Result<(), DeliverError> {
        let (uid, queue, wake) = self.handles().await?;
        let requeued = queue.lock().unwrap().retry_failed(id);
        if !requeued {
            return Err(DeliverError::UnknownEntry(id));
        }
        persist_queue(&self.store, uid, &queue).await?;
        wake.notify_one();
        Ok(())
    }

    async fn handles(
        &self,
    ) -> Result<
        (
            Uid,
            Arc<std::sync::Mutex<OutboxQueue>>,
            Arc<tokio::sync::Notify>,
        ),
        DeliverError,
    > {
        let active = self.active.lock().await;
        let active = active.as_ref().ok_or(DeliverError::NotStarted)?;
        Ok((
            active.uid,
            Arc::clone(&active.queue),
            Arc::clone(&active.wake),
        ))
    }

    async fn halt(active: Active) {
        active.stop.cancel();
        active.wake.notify_one();
        if active.task.await.is_err() {
            tracing::warn!("deliverer drain task panicked");
        }
    }
}

fn wake_if_some(active: &Option<Active>) {
    if let Some(a) = active.as_ref() {
        a.wake.notify_one();
    }
}

fn store_key(uid: Uid) -> String {
    hex::encode(uid.as_bytes())
}

async fn persist_queue(
    store: &Arc<dyn KvStore>,
    uid: Uid,
    queue: &Arc<std::sync::Mutex<OutboxQueue>>,
) -> Result<(), DeliverError> {
    let snapshot = { queue.lock().unwrap().snapshot() };
    let bytes = encode_value(&snapshot)?;
    store.put(OUTBOX_TABLE, &store_key(uid), &bytes).await?;
    Ok(())
}

struct DrainHandles {
    sender: Arc<dyn MessageSender>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: DelivererConfig,
    uid: Uid,
    queue: Arc<std::sync::Mutex<OutboxQueue>>,
    wake: Arc<tokio::sync::Notify>,
    stop: CancellationToken,
}

/// The drain loop: claim the next deliverable entry, attempt it, record
/// the outcome, persist. Sleeps when the queue is idle or every head is
/// backing off; wakes on enqueue or retry-timer expiry.
async fn drain_loop(h: DrainHandles) {
    let ctx = Context::with_cancel(h.stop.child_token());
    loop {
        if h.stop.is_cancelled() {
            return;
        }

        let now = h.clock.now_ms();
        let claimed = { h.queue.lock().unwrap().next_ready(now) };
        match claimed {
            Some(entry) => {
                let result = h.sender.send(&ctx, entry.conversation, &entry.payload).await;
                record_outcome(&h, &entry, result);
                if let Err(err) = persist_queue(&h.store, h.uid, &h.queue).await {
                    tracing::error!("outbox persist failed: {err}");
                }
            }
            None => {
                let now = h.clock.now_ms();
                let sleep_ms = {
                    let queue = h.queue.lock().unwrap();
                    match queue.next_wake_ms(now) {
                        Some(at) => Some(at.saturating_sub(now)),
                        // A head became ready between the claim attempt
                        // and now; go around again instead of parking.
                        None if !queue.is_idle() => Some(0),
                        None => None,
                    }
                };
                if sleep_ms == Some(0) {
                    continue;
                }
                tokio::select! {
                    _ = h.stop.cancelled() => return,
                    _ = h.wake.notified() => {}
                    _ = async {
                        match sleep_ms {
                            Some(ms) => tokio::time::sleep(std::time::Duration::from_millis(ms)).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {}
                }
            }
        }
    }
}

fn record_outcome(h: &DrainHandles, entry: &OutboxEntry, result: Result<(), SendFailure>) {
    let mut queue = h.queue.lock().unwrap();
    match result {
        Ok(()) => {
            queue.mark_sent(entry.id);
            tracing::debug!(id = %entry.id, conv = %entry.conversation, "message delivered");
        }
        Err(SendFailure::Transient(reason)) => {
            let attempt = entry.attempts + 1;
            if attempt < h.config.max_attempts {
                let delay = h.config.backoff.delay(attempt);
                let retry_at = h.clock.now_ms() + delay.as_millis() as u64;
                queue.mark_retry(entry.id, retry_at);
                tracing::debug!(
                    id = %entry.id,
                    attempt,
                    ?delay,
                    "transient delivery failure, will retry: {reason}"
                );
            } else {
                queue.mark_failed(
                    entry.id,
                    format!("gave up after {attempt} attempts: {reason}"),
                );
                tracing::warn!(id = %entry.id, attempt, "delivery abandoned: {reason}");
            }
        }
        Err(SendFailure::Permanent(reason)) => {
            queue.mark_failed(entry.id, reason.clone());
            tracing::warn!(id = %entry.id, "permanent delivery failure: {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted sender: per-payload failure plans, plus a global gate that
    /// fails everything while closed.
    #[derive(Default)]
    struct ScriptedSender {
        delivered: Mutex<Vec<(ConversationId, Vec<u8>)>>,
        plans: Mutex<HashMap<Vec<u8>, Vec<SendFailure>>>,
        gate_closed: AtomicBool,
    }

    impl ScriptedSender {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn delivered(&self) -> Vec<Vec<u8>> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| p.clone())
                .collect()
        }

        /// Queue failures returned (in order) before the payload succeeds.
        fn plan_failures(&self, payload: &[u8], failures: Vec<SendFailure>) {
            self.plans
                .lock()
                .unwrap()
                .insert(payload.to_vec(), failures);
        }

        fn close_gate(&self) {
            self.gate_closed.store(true, Ordering::SeqCst);
        }

        fn open_gate(&self) {
            self.gate_closed.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send(
            &self,
            _ctx: &Context,
            conversation: ConversationId,
            payload: &[u8],
        ) -> Result<(), SendFailure> {
            if self.gate_closed.load(Ordering::SeqCst) {
                return Err(SendFailure::Transient("gate closed".into()));
            }
            {
                let mut plans = self.plans.lock().unwrap();
                if let Some(failures) = plans.get_mut(payload) {
                    if !failures.is_empty() {
                        return Err(failures.remove(0));
                    }
                }
            }
            self.delivered
                .lock()
                .unwrap()
                .push((conversation, payload.to_vec()));
            Ok(())
        }
    }

    fn fast_config(max_attempts: u32) -> DelivererConfig {
        DelivererConfig {
            backoff: Backoff::new(
                Duration::from_millis(2),
                Duration::from_millis(10),
                Duration::ZERO,
            ),
            max_attempts,
        }
    }

    async fn wait_for_deliveries(sender: &ScriptedSender, count: usize) {
        for _ in 0..500 {
            if sender.delivered().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for {count} deliveries, got {:?}",
            sender.delivered()
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_for_same_identity() {
        let sender = ScriptedSender::new();
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender.clone(), store, fast_config(3));
        let ctx = Context::background();
        let uid = Uid::random();

        deliverer.start(&ctx, uid).await.unwrap();
        deliverer.start(&ctx, uid).await.unwrap();
        assert!(deliverer.is_active().await);

        deliverer
            .queue(&ctx, ConversationId::random(), b"hello".to_vec())
            .await
            .unwrap();
        wait_for_deliveries(&sender, 1).await;
        assert_eq!(sender.delivered(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn same_conversation_is_delivered_in_order_despite_retries() {
        let sender = ScriptedSender::new();
        sender.plan_failures(
            b"e1",
            vec![
                SendFailure::Transient("timeout".into()),
                SendFailure::Transient("timeout".into()),
            ],
        );
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender.clone(), store, fast_config(10));
        let ctx = Context::background();
        deliverer.start(&ctx, Uid::random()).await.unwrap();

        let conv = ConversationId::random();
        deliverer.queue(&ctx, conv, b"e1".to_vec()).await.unwrap();
        deliverer.queue(&ctx, conv, b"e2".to_vec()).await.unwrap();
        deliverer.queue(&ctx, conv, b"e3".to_vec()).await.unwrap();

        wait_for_deliveries(&sender, 3).await;
        assert_eq!(
            sender.delivered(),
            vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()]
        );
    }

    #[tokio::test]
    async fn permanent_failure_does_not_block_the_next_entry() {
        let sender = ScriptedSender::new();
        sender.plan_failures(b"doomed", vec![SendFailure::Permanent("no key".into())]);
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender.clone(), store, fast_config(3));
        let ctx = Context::background();
        deliverer.start(&ctx, Uid::random()).await.unwrap();

        let conv = ConversationId::random();
        deliverer.queue(&ctx, conv, b"doomed".to_vec()).await.unwrap();
        deliverer.queue(&ctx, conv, b"next".to_vec()).await.unwrap();

        wait_for_deliveries(&sender, 1).await;
        assert_eq!(sender.delivered(), vec![b"next".to_vec()]);

        let failed = deliverer.failed_entries(&ctx).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload, b"doomed");
    }

    #[tokio::test]
    async fn transient_failures_exhaust_into_permanent() {
        let sender = ScriptedSender::new();
        sender.plan_failures(
            b"flaky",
            vec![
                SendFailure::Transient("t1".into()),
                SendFailure::Transient("t2".into()),
                SendFailure::Transient("t3".into()),
            ],
        );
        let store = Arc::new(MemoryStore::new());
        // Cap of 3: the third transient failure exhausts the entry.
        let deliverer = Deliverer::new(sender.clone(), store, fast_config(3));
        let ctx = Context::background();
        deliverer.start(&ctx, Uid::random()).await.unwrap();

        deliverer
            .queue(&ctx, ConversationId::random(), b"flaky".to_vec())
            .await
            .unwrap();

        for _ in 0..500 {
            if !deliverer.failed_entries(&ctx).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let failed = deliverer.failed_entries(&ctx).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(sender.delivered().is_empty());
    }

    #[tokio::test]
    async fn stop_start_resumes_each_entry_exactly_once() {
        let sender = ScriptedSender::new();
        sender.close_gate();
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender.clone(), store.clone(), fast_config(1000));
        let ctx = Context::background();
        let uid = Uid::random();

        deliverer.start(&ctx, uid).await.unwrap();
        deliverer
            .queue(&ctx, ConversationId::derive("a"), b"m1".to_vec())
            .await
            .unwrap();
        deliverer
            .queue(&ctx, ConversationId::derive("b"), b"m2".to_vec())
            .await
            .unwrap();

        // Let the loop churn on the closed gate, then stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        deliverer.stop(&ctx).await;
        assert!(!deliverer.is_active().await);
        assert!(sender.delivered().is_empty());

        // Restart for the same identity: both entries drain exactly once.
        sender.open_gate();
        deliverer.start(&ctx, uid).await.unwrap();
        wait_for_deliveries(&sender, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut delivered = sender.delivered();
        delivered.sort();
        assert_eq!(delivered, vec![b"m1".to_vec(), b"m2".to_vec()]);
    }

    #[tokio::test]
    async fn new_identity_resets_bookkeeping() {
        let sender = ScriptedSender::new();
        sender.close_gate();
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender.clone(), store, fast_config(1000));
        let ctx = Context::background();
        let alice = Uid::random();
        let bob = Uid::random();

        deliverer.start(&ctx, alice).await.unwrap();
        deliverer
            .queue(&ctx, ConversationId::random(), b"for-alice".to_vec())
            .await
            .unwrap();
        deliverer.stop(&ctx).await;

        // Bob's session sees an empty queue.
        deliverer.start(&ctx, bob).await.unwrap();
        assert_eq!(deliverer.pending_count(&ctx).await.unwrap(), 0);
        deliverer.stop(&ctx).await;

        // Alice's entry is still waiting for her next session.
        deliverer.start(&ctx, alice).await.unwrap();
        assert_eq!(deliverer.pending_count(&ctx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_failed_requeues_and_delivers() {
        let sender = ScriptedSender::new();
        sender.plan_failures(b"once", vec![SendFailure::Permanent("rejected".into())]);
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender.clone(), store, fast_config(3));
        let ctx = Context::background();
        deliverer.start(&ctx, Uid::random()).await.unwrap();

        let id = deliverer
            .queue(&ctx, ConversationId::random(), b"once".to_vec())
            .await
            .unwrap();

        for _ in 0..500 {
            if !deliverer.failed_entries(&ctx).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // The plan is exhausted, so the user-requested retry succeeds.
        deliverer.retry_failed(&ctx, id).await.unwrap();
        wait_for_deliveries(&sender, 1).await;
        assert!(deliverer.failed_entries(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operations_require_start() {
        let sender = ScriptedSender::new();
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender, store, fast_config(3));
        let ctx = Context::background();

        assert!(matches!(
            deliverer
                .queue(&ctx, ConversationId::random(), b"x".to_vec())
                .await,
            Err(DeliverError::NotStarted)
        ));
        assert!(matches!(
            deliverer.failed_entries(&ctx).await,
            Err(DeliverError::NotStarted)
        ));

        // Stop without start is a quiet no-op.
        deliverer.stop(&ctx).await;
    }

    #[tokio::test]
    async fn retry_failed_unknown_id_errors() {
        let sender = ScriptedSender::new();
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(sender, store, fast_config(3));
        let ctx = Context::background();
        deliverer.start(&ctx, Uid::random()).await.unwrap();

        assert!(matches!(
            deliverer.retry_failed(&ctx, OutboxId::new()).await,
            Err(DeliverError::UnknownEntry(_))
        ));
    }
}
