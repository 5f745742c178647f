//! Injectable time and randomness sources.
//!
//! The daemon owns one clock and one RNG; both are constructor arguments of
//! the engine so tests can substitute deterministic implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A sleep was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Source of wall-clock time and of interruptible sleeps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Sleep for `dur`, waking early if `cancel` fires.
    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> Result<(), Interrupted>;
}

/// Cooperative cancellation handle shared between a worker and whoever may
/// abort it (daemon shutdown, or a test driving the EINTR path).
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(CancelInner {
                cancelled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block for up to `dur`. Returns true if cancellation fired first.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self
                .inner
                .condvar
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                return *cancelled;
            }
        }
        true
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall clock backed by the OS.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> Result<(), Interrupted> {
        if cancel.wait_timeout(dur) {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Manually stepped clock. Sleeps complete instantly, advance the clock by
/// the requested amount, and are recorded so tests can assert on them.
pub struct ManualClock {
    now_ms: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now_ms: AtomicU64::new(start_ms),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn recorded_sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, dur: Duration, cancel: &CancelToken) -> Result<(), Interrupted> {
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        self.sleeps.lock().push(dur);
        self.now_ms.fetch_add(dur.as_millis() as u64, Ordering::SeqCst);
        Ok(())
    }
}

/// Daemon-wide RNG behind a lock so concurrent workers draw from one stream.
pub struct SharedRng {
    rng: Mutex<StdRng>,
}

impl SharedRng {
    pub fn seeded(seed: u64) -> Self {
        SharedRng {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_os() -> Self {
        SharedRng {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Uniform draw from `[0, 1)`.
    pub fn next_unit(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }
}
