//! Time and identifier sources.
//!
//! Wall-clock readings, monotonic elapsed time, and id generation are
//! injected behind small traits so the state machines that depend on them
//! (session expiry, view durations) stay deterministic under test.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of wall-clock and monotonic time.
///
/// `now` is for event timestamps only. All elapsed-time decisions (session
/// expiry, view duration, batch age) use `monotonic`, which never goes
/// backward even when the device wall clock is changed.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic reading since an arbitrary fixed origin.
    fn monotonic(&self) -> Duration;
}

/// Generator of unique identifiers for sessions and views.
pub trait IdGenerator: Send + Sync {
    /// Produce a fresh identifier.
    fn next_id(&self) -> Uuid;
}

/// Production clock backed by the OS.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Production id generator (random v4 UUIDs).
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Manually advanced clock for tests.
///
/// Wall and monotonic readings move together via [`ManualClock::advance`].
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(DateTime<Utc>, Duration)>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((start, Duration::ZERO)),
        }
    }

    /// Move both readings forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut state = self.state.lock().expect("clock lock poisoned");
        state.0 += chrono::Duration::from_std(delta).expect("delta out of range");
        state.1 += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().expect("clock lock poisoned").0
    }

    fn monotonic(&self) -> Duration {
        self.state.lock().expect("clock lock poisoned").1
    }
}

/// Deterministic id generator for tests; yields 1, 2, 3, ... as UUIDs.
#[derive(Debug, Default)]
pub struct SequentialIds {
    counter: AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Uuid {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(u128::from(n))
    }
}
