//! Scheduled flush shared by the persisted stores.
//!
//! Disk writes for the reflex pattern table, lesson store, and model
//! stats are coalesced on a debounce timer. On shutdown every target is
//! flushed unconditionally, in registration order (patterns first, then
//! lessons, then stats), before the kernel reports clean shutdown.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub trait FlushTarget: Send + Sync {
    fn name(&self) -> &'static str;
    fn flush(&self) -> Result<()>;
}

struct FlusherInner {
    /// Flush order is registration order (dependency order).
    targets: Mutex<Vec<Arc<dyn FlushTarget>>>,
    dirty: AtomicBool,
    notify: Notify,
    shutdown: AtomicBool,
    debounce: Duration,
    flushes: AtomicU64,
}

pub struct Flusher {
    inner: Arc<FlusherInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Flusher {
    pub fn new(debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(FlusherInner {
                targets: Mutex::new(Vec::new()),
                dirty: AtomicBool::new(false),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                debounce,
                flushes: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        })
    }

    pub fn register(&self, target: Arc<dyn FlushTarget>) {
        self.inner.targets.lock().unwrap().push(target);
    }

    /// Spawn the coalescing background task.
    pub fn start(self: &Arc<Self>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let notified = inner.notify.notified();
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if !inner.dirty.load(Ordering::SeqCst) {
                    notified.await;
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                // Debounce window: further mark_dirty calls coalesce here.
                tokio::time::sleep(inner.debounce).await;
                if inner.dirty.swap(false, Ordering::SeqCst) {
                    flush_all(&inner);
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    /// Flush everything now, in order. Used by tests and shutdown.
    pub fn flush_now(&self) {
        flush_all(&self.inner);
    }

    /// Completed flush passes.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    /// Stop the timer task and run the mandatory final ordered flush.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        flush_all(&self.inner);
        info!("Persisted stores flushed");
    }
}

fn flush_all(inner: &FlusherInner) {
    let targets = inner.targets.lock().unwrap().clone();
    for target in targets {
        match target.flush() {
            Ok(()) => debug!("Flushed {}", target.name()),
            Err(e) => error!("Flush failed for {}: {:#}", target.name(), e),
        }
    }
    inner.flushes.fetch_add(1, Ordering::SeqCst);
}
