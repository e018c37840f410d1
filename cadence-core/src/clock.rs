//! Monotonic time source shared by playback and keyer input.
//!
//! Every timestamp the engine compares lives on one timeline: milliseconds
//! since the clock's origin. Callers may hand in Unix-epoch milliseconds
//! (touch events on some platforms carry them); `normalize_timestamp` maps
//! those through the wall/monotonic offset captured at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Anything at or above this is treated as Unix-epoch milliseconds
/// (2001-09-09). Monotonic values never get near it within a process lifetime.
pub const EPOCH_THRESHOLD_MS: f64 = 1.0e12;

/// Monotonic millisecond clock.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since this clock's origin. Never decreases.
    fn now_ms(&self) -> f64;

    /// Unix-epoch milliseconds corresponding to monotonic `0.0`.
    fn epoch_origin_ms(&self) -> f64;

    /// Map a caller-supplied timestamp onto the monotonic timeline.
    ///
    /// `None` means "now". Epoch-looking values are shifted by the origin
    /// offset; anything else is assumed to already be monotonic.
    fn normalize_timestamp(&self, ts_ms: Option<f64>) -> f64 {
        match ts_ms {
            None => self.now_ms(),
            Some(ts) if !ts.is_finite() => self.now_ms(),
            Some(ts) if ts >= EPOCH_THRESHOLD_MS => (ts - self.epoch_origin_ms()).max(0.0),
            Some(ts) => ts.max(0.0),
        }
    }
}

/// Shared clock handle passed into every component.
pub type SharedClock = Arc<dyn Clock>;

/// `Instant`-backed clock. The default for real sessions.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
    epoch_origin_ms: f64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let epoch_origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        Self {
            origin: Instant::now(),
            epoch_origin_ms,
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }

    /// The `Instant` corresponding to monotonic `0.0`.
    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn epoch_origin_ms(&self) -> f64 {
        self.epoch_origin_ms
    }
}

/// Clock backed by tokio's time source.
///
/// Follows `tokio::time::pause()` / `advance()` so timer-driven behaviour can
/// be tested deterministically. Must be created inside a runtime context.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    epoch_origin_ms: f64,
}

impl TokioClock {
    pub fn new() -> Self {
        let epoch_origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        Self {
            origin: tokio::time::Instant::now(),
            epoch_origin_ms,
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn epoch_origin_ms(&self) -> f64 {
        self.epoch_origin_ms
    }
}

/// Hand-driven clock for replaying recorded sessions and for tests.
///
/// Stores microseconds in an atomic so it can be shared across threads.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
    epoch_origin_ms: f64,
}

impl ManualClock {
    pub fn new(epoch_origin_ms: f64) -> Self {
        Self {
            now_us: AtomicU64::new(0),
            epoch_origin_ms,
        }
    }

    pub fn set_ms(&self, ms: f64) {
        let us = (ms.max(0.0) * 1000.0) as u64;
        // fetch_max keeps the clock monotonic even if a caller rewinds it.
        self.now_us.fetch_max(us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: f64) {
        let us = (ms.max(0.0) * 1000.0) as u64;
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.now_us.load(Ordering::SeqCst) as f64 / 1000.0
    }

    fn epoch_origin_ms(&self) -> f64 {
        self.epoch_origin_ms
    }
}
