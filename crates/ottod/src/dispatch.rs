//! Ingress dispatcher.
//!
//! Merges every input source into one ordered stream. Pop order is
//! strictly (priority, sequence) ascending; sequence numbers are
//! monotonic so arrival order breaks ties within a band.
//!
//! Urgent enqueues cooperatively signal cancellation to in-flight
//! proactive-band work; nothing is force-terminated.

use otto_common::config::QueueConfig;
use otto_common::request::{CancelToken, Request, RequestId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

struct QueueState {
    /// Keyed by (priority, seq) so iteration order is the pop order.
    queue: BTreeMap<(i32, u64), Request>,
    band_counts: HashMap<i32, usize>,
    /// Tokens for queued and in-flight requests, for `cancel()`.
    tokens: HashMap<RequestId, CancelToken>,
    /// Currently processing requests: (priority, id, token).
    active: Vec<(i32, RequestId, CancelToken)>,
}

struct DispatchInner {
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
    shutdown: AtomicBool,
    dropped: AtomicU64,
    config: QueueConfig,
}

#[derive(Clone)]
pub struct IngressDispatcher {
    inner: Arc<DispatchInner>,
}

impl IngressDispatcher {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                state: Mutex::new(QueueState {
                    queue: BTreeMap::new(),
                    band_counts: HashMap::new(),
                    tokens: HashMap::new(),
                    active: Vec::new(),
                }),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Enqueue a request. Never blocks the caller.
    pub fn submit(&self, priority: i32, payload: impl Into<String>, source: &str) -> RequestId {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let request = Request {
            id: RequestId::new(),
            priority,
            seq,
            payload: payload.into(),
            source: source.to_string(),
            cancel: CancelToken::new(),
            enqueued_at: chrono::Utc::now(),
        };
        let id = request.id;

        let mut state = self.inner.state.lock().unwrap();

        let band_len = state.band_counts.get(&priority).copied().unwrap_or(0);
        if band_len >= self.inner.config.band_capacity {
            self.evict_one(&mut state, priority);
        }

        state.tokens.insert(id, request.cancel.clone());
        state.queue.insert((priority, seq), request);
        *state.band_counts.entry(priority).or_insert(0) += 1;

        // Urgent arrivals ask running proactive work to yield.
        if priority <= self.inner.config.urgent_band {
            for (active_priority, active_id, token) in &state.active {
                if *active_priority >= self.inner.config.proactive_band {
                    debug!("Urgent enqueue: signalling cancellation to {}", active_id);
                    token.cancel();
                }
            }
        }
        drop(state);

        self.inner.notify.notify_one();
        id
    }

    /// Evict the oldest item of the lowest-priority non-urgent band.
    /// Urgent-band items are never evicted; if only urgent items are
    /// queued the band is allowed to grow past its bound.
    fn evict_one(&self, state: &mut QueueState, incoming_priority: i32) {
        let victim_priority = state
            .queue
            .keys()
            .map(|(priority, _)| *priority)
            .filter(|priority| *priority > self.inner.config.urgent_band)
            .max();
        let Some(victim_priority) = victim_priority else {
            warn!(
                "Band {} over capacity but only urgent items queued; accepting overflow",
                incoming_priority
            );
            return;
        };
        let victim_key = state
            .queue
            .range((victim_priority, 0)..)
            .next()
            .map(|(key, _)| *key);
        if let Some(key) = victim_key {
            if let Some(victim) = state.queue.remove(&key) {
                *state.band_counts.entry(key.0).or_insert(1) -= 1;
                state.tokens.remove(&victim.id);
                victim.cancel.cancel();
                self.inner.dropped.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "Queue overflow: dropped request {} (priority {}, source {})",
                    victim.id, victim.priority, victim.source
                );
            }
        }
    }

    /// Single consumer call. Suspends until an item is available or the
    /// dispatcher has shut down (then `None`).
    pub async fn next(&self) -> Option<Request> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().unwrap();
                if let Some((key, request)) = state.queue.pop_first() {
                    if let Some(count) = state.band_counts.get_mut(&key.0) {
                        *count = count.saturating_sub(1);
                    }
                    return Some(request);
                }
                if self.inner.shutdown.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Cooperative cancellation: marks the token; in-flight work polls
    /// it at suspension points.
    pub fn cancel(&self, id: RequestId) -> bool {
        let state = self.inner.state.lock().unwrap();
        match state.tokens.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Register a dequeued request as actively processing so urgent
    /// arrivals can signal it. The guard unregisters on drop.
    pub fn track_active(&self, request: &Request) -> ActiveGuard {
        let mut state = self.inner.state.lock().unwrap();
        state
            .active
            .push((request.priority, request.id, request.cancel.clone()));
        ActiveGuard {
            inner: Arc::clone(&self.inner),
            id: request.id,
        }
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

/// Removes the request from the active set (and the token table) when
/// processing ends.
pub struct ActiveGuard {
    inner: Arc<DispatchInner>,
    id: RequestId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.active.retain(|(_, id, _)| *id != self.id);
        state.tokens.remove(&self.id);
    }
}
