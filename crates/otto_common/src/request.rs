//! Request types for the ingress dispatcher.
//!
//! A request is immutable once enqueued except for its cancellation flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Priority bands used by Otto's own source adapters. The dispatcher
/// itself is agnostic to band meaning, only to integer ordering.
pub const BAND_URGENT: i32 = 10;
pub const BAND_INTERACTIVE: i32 = 20;
pub const BAND_PROACTIVE: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cooperative cancellation token. In-flight work polls it at suspension
/// points; nothing is force-terminated.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Suspend until cancellation is requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// A unit of work merged into the single ordered stream.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    /// Lower is more urgent.
    pub priority: i32,
    /// Monotonic tie-break within a priority band.
    pub seq: u64,
    pub payload: String,
    /// Source adapter id; also used as the confirmation session key.
    pub source: String,
    pub cancel: CancelToken,
    pub enqueued_at: DateTime<Utc>,
}
