//! Subscriber fan-out with per-sink bounded queues.
//!
//! Every subscriber owns a bounded envelope queue and an independent consumer
//! (the IPC client handler or WebSocket handler draining it). Delivery is a
//! non-blocking `try_send`: a slow consumer never stalls the PTY reader or any
//! other consumer. On overflow the envelope is dropped, the subscriber's
//! dropped counter is bumped, and a single coalesced [`Envelope::Resync`]
//! marker is queued so the consumer knows its view has a gap. A subscriber
//! whose queue stays saturated past the grace period is evicted; its handler
//! observes the eviction flag and reports `BACKPRESSURE` before closing.
//!
//! The subscriber list is guarded by a mutex; fan-out iterates over a
//! snapshot so concurrent subscribe/unsubscribe cannot deadlock the producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::debug;

use crate::protocol::StatusUpdate;
use crate::pty::ExitInfo;

/// What kind of sink is consuming a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    IpcClient,
    WsClient,
}

impl SinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IpcClient => "ipc-client",
            Self::WsClient => "ws-client",
        }
    }
}

/// One delivery unit on a subscriber queue.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// A chunk of PTY output.
    Output(Bytes),
    /// An app status update from another client.
    Status(StatusUpdate),
    /// The terminal was resized.
    Resize { cols: u16, rows: u16 },
    /// The session exited; no further output will follow.
    Exit(ExitInfo),
    /// Output was dropped for this subscriber; its view has a gap.
    Resync,
}

/// Shared per-subscriber bookkeeping, visible to both the set and the consumer.
pub struct SubscriberState {
    kind: SinkKind,
    dropped: AtomicU64,
    resync_pending: AtomicBool,
    evicted: AtomicBool,
    /// Millis since the set's epoch (+1) of the first unrelieved overflow;
    /// 0 means the queue is not saturated.
    saturated_since: AtomicU64,
}

/// Consumer-side handle: the queue receiver plus shared state.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Envelope>,
    state: Arc<SubscriberState>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SinkKind {
        self.state.kind
    }

    /// Envelopes dropped due to a full queue.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Whether the set evicted this subscriber for sustained backpressure.
    pub fn was_evicted(&self) -> bool {
        self.state.evicted.load(Ordering::Relaxed)
    }

    /// Receive the next envelope; `None` once unsubscribed, evicted, or the
    /// session tore the set down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by tests and drain paths.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
struct Slot {
    id: u64,
    tx: mpsc::Sender<Envelope>,
    state: Arc<SubscriberState>,
}

/// The session-side subscriber registry.
pub struct SubscriberSet {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    queue_len: usize,
    grace: Duration,
    epoch: Instant,
}

impl SubscriberSet {
    pub fn new(queue_len: usize, grace: Duration) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_len: queue_len.max(1),
            grace,
            epoch: Instant::now(),
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Register a new subscriber and hand back its consumer handle.
    pub async fn subscribe(&self, kind: SinkKind) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_len);
        let state = Arc::new(SubscriberState {
            kind,
            dropped: AtomicU64::new(0),
            resync_pending: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            saturated_since: AtomicU64::new(0),
        });
        self.slots.lock().await.push(Slot {
            id,
            tx,
            state: Arc::clone(&state),
        });
        Subscription { id, rx, state }
    }

    /// Remove a subscriber. Idempotent; the consumer's queue drains out and
    /// then closes.
    pub async fn unsubscribe(&self, id: u64) {
        self.slots.lock().await.retain(|s| s.id != id);
    }

    /// Push directly onto one subscriber's queue (used for the initial status
    /// replay right after subscribing).
    pub async fn push_to(&self, id: u64, envelope: Envelope) {
        let slot = {
            let slots = self.slots.lock().await;
            slots.iter().find(|s| s.id == id).cloned()
        };
        if let Some(slot) = slot {
            let _ = slot.tx.try_send(envelope);
        }
    }

    /// Fan an envelope out to every subscriber.
    pub async fn publish(&self, envelope: Envelope) {
        self.publish_except(None, envelope).await;
    }

    /// Fan an envelope out to every subscriber except `origin` (used for
    /// status updates, which must not echo back to their sender).
    pub async fn publish_except(&self, origin: Option<u64>, envelope: Envelope) {
        let snapshot: Vec<Slot> = self.slots.lock().await.clone();
        let mut stale: Vec<u64> = Vec::new();

        for slot in &snapshot {
            if Some(slot.id) == origin {
                continue;
            }
            self.offer(slot, envelope.clone(), &mut stale);
        }

        if !stale.is_empty() {
            let mut slots = self.slots.lock().await;
            slots.retain(|s| !stale.contains(&s.id));
        }
    }

    /// Drop every subscriber (session teardown). Consumers observe a closed
    /// queue after draining what was already delivered.
    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    fn offer(&self, slot: &Slot, envelope: Envelope, stale: &mut Vec<u64>) {
        // A pending resync marker goes first so the consumer learns about the
        // gap before anything newer.
        if slot.state.resync_pending.load(Ordering::Relaxed)
            && slot.tx.try_send(Envelope::Resync).is_ok()
        {
            slot.state.resync_pending.store(false, Ordering::Relaxed);
        }

        match slot.tx.try_send(envelope) {
            Ok(()) => {
                slot.state.saturated_since.store(0, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                slot.state.dropped.fetch_add(1, Ordering::Relaxed);
                slot.state.resync_pending.store(true, Ordering::Relaxed);

                let now = self.epoch.elapsed().as_millis() as u64 + 1;
                let since = slot.state.saturated_since.load(Ordering::Relaxed);
                if since == 0 {
                    slot.state.saturated_since.store(now, Ordering::Relaxed);
                } else if now.saturating_sub(since) >= self.grace.as_millis() as u64 {
                    debug!(
                        "Evicting {} subscriber {} after {}ms of backpressure",
                        slot.state.kind.as_str(),
                        slot.id,
                        now - since
                    );
                    slot.state.evicted.store(true, Ordering::Relaxed);
                    stale.push(slot.id);
                }
            }
            Err(TrySendError::Closed(_)) => {
                // Consumer went away without unsubscribing.
                stale.push(slot.id);
            }
        }
    }
}
