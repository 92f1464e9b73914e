// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fan-out of [`PipelineEvent`]s to WebSocket subscribers with a bounded
//! per-subscriber outbox, priority-aware coalescing, and lag/disconnect
//! policy.
//!
//! Unlike a plain `tokio::broadcast` channel, publishing here never drops a
//! `Critical`/`Normal` event to make room; only `Low`-priority progress
//! events are coalesced or dropped under backpressure.

use isx_core::{PipelineEvent, Priority};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Notify;

const OUTBOX_CAPACITY: usize = 256;
const DISCONNECT_AFTER_CONSECUTIVE_DROPS: u32 = 64;

struct Outbox {
    queue: StdMutex<VecDeque<PipelineEvent>>,
    notify: Notify,
    lag: AtomicU64,
    consecutive_drops: AtomicU32,
    disconnected: AtomicBool,
}

impl Outbox {
    fn new() -> Self {
        Self {
            queue: StdMutex::new(VecDeque::with_capacity(OUTBOX_CAPACITY)),
            notify: Notify::new(),
            lag: AtomicU64::new(0),
            consecutive_drops: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, event: &PipelineEvent) {
        if self.disconnected.load(Ordering::Relaxed) {
            return;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(key) = event.coalesce_key() {
            if let Some(pos) = queue.iter().position(|e| e.coalesce_key().as_deref() == Some(key.as_str())) {
                queue.remove(pos);
            }
        }

        if queue.len() >= OUTBOX_CAPACITY {
            match queue.iter().position(|e| e.priority() == Priority::Low) {
                Some(evict_at) => {
                    queue.remove(evict_at);
                    self.lag.fetch_add(1, Ordering::Relaxed);
                    let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if drops > DISCONNECT_AFTER_CONSECUTIVE_DROPS {
                        self.disconnected.store(true, Ordering::Relaxed);
                        queue.clear();
                        return;
                    }
                }
                // No Low-priority event to evict. A Low-priority arrival is
                // dropped outright rather than evicting a Critical/Normal
                // event; a Critical/Normal arrival grows the queue past
                // capacity, since those must never be dropped.
                None if event.priority() == Priority::Low => {
                    self.lag.fetch_add(1, Ordering::Relaxed);
                    let drops = self.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if drops > DISCONNECT_AFTER_CONSECUTIVE_DROPS {
                        self.disconnected.store(true, Ordering::Relaxed);
                        queue.clear();
                    }
                    return;
                }
                None => {
                    self.consecutive_drops.store(0, Ordering::Relaxed);
                }
            }
        } else {
            self.consecutive_drops.store(0, Ordering::Relaxed);
        }

        queue.push_back(event.clone());
        drop(queue);
        self.notify.notify_one();
    }
}

/// A receive-only stream of framed events for one subscriber.
pub struct EventSubscription {
    id: u64,
    state: Arc<Outbox>,
    registry: Arc<StdMutex<Vec<(u64, Arc<Outbox>)>>>,
    unsubscribed: AtomicBool,
}

impl EventSubscription {
    /// Receive the next event, waiting asynchronously. Returns `None` once
    /// this subscriber has been disconnected for exceeding the consecutive
    /// drop limit.
    pub async fn recv(&self) -> Option<PipelineEvent> {
        loop {
            if self.state.disconnected.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(event) = self.state.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
                return Some(event);
            }
            self.state.notify.notified().await;
        }
    }

    /// Total events dropped (lagged) for this subscriber so far.
    #[must_use]
    pub fn lag(&self) -> u64 {
        self.state.lag.load(Ordering::Relaxed)
    }

    /// Whether the broadcaster has disconnected this subscriber.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::Relaxed)
    }

    /// Stop receiving events. Idempotent.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).retain(|(id, _)| *id != self.id);
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Broadcasts [`PipelineEvent`]s to every live subscription.
pub struct EventBroadcaster {
    subscribers: Arc<StdMutex<Vec<(u64, Arc<Outbox>)>>>,
    next_id: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    /// Create a broadcaster with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Publish an event to every current subscriber. Never blocks on a slow
    /// subscriber; backpressure is resolved per-subscriber.
    pub fn publish(&self, event: &PipelineEvent) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for (_, outbox) in subscribers {
            outbox.enqueue(event);
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Outbox::new());
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::clone(&state)));
        EventSubscription {
            id,
            state,
            registry: Arc::clone(&self.subscribers),
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// Number of subscribers currently registered (including any pending
    /// disconnect on next enqueue).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
