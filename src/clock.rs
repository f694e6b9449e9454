//! Injectable time source
//!
//! TTL checks, backoff timing, and breaker transitions all read time through
//! this seam so they can be tested deterministically with `ManualClock`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant for interval arithmetic (cache age, breaker windows)
    fn instant(&self) -> Instant;

    /// Wall-clock time for persisted timestamps (override expiry)
    fn utc(&self) -> DateTime<Utc>;
}

/// Production clock backed by the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same offset, so a test can hold one handle while the
/// component under test holds another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc: Utc::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn instant(&self) -> Instant {
        self.base_instant + *self.offset.lock()
    }

    fn utc(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.base_utc + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::MAX)
    }
}
