//! Keyer input pipeline.
//!
//! ```text
//! Idle ──begin_attempt──► Armed ──down──► Pressing ──up──► Released ──down──► Pressing …
//!   ▲                                         │                 │
//!   └──────────── verdict (Correct | Wrong | Timeout) ◄─────────┘
//! ```
//!
//! Press-down validates the gap since the previous release (must be an
//! intra-character gap). Press-up classifies the press and compares the
//! accumulated symbols against the expected pattern prefix.
//!
//! Two timers guard the machine: the idle timeout after a partial match and
//! the stuck-key watchdog while pressing. Both capture a token from the
//! keyer's `Generation` plus the session id and attempt number, and re-check
//! all three under the lock before acting.

pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::{CadenceError, Result};
use crate::ipc::events::{ScoreSummary, Verdict, VerdictEvent, VerdictReason};
use crate::playback::Generation;
use crate::settings::SettingsSnapshot;
use crate::timing::{classify_gap, classify_signal, MorseGap, Pattern, Tolerance};

pub use session::{KeyerMode, KeyerSessionState, KeyerState, PressWindow};
use session::Session;

/// Force-release after a press held this long.
pub const DEFAULT_WATCHDOG_MS: f64 = 1_800.0;

/// Lower bound of the idle timeout after a partial match.
pub const DEFAULT_IDLE_FLOOR_MS: f64 = 600.0;

/// Idle timeout in units: a word gap plus 20%.
const IDLE_TIMEOUT_UNITS: f64 = 7.0 * 1.2;

const VERDICT_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyerConfig {
    pub watchdog_ms: f64,
    pub idle_floor_ms: f64,
}

impl Default for KeyerConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: DEFAULT_WATCHDOG_MS,
            idle_floor_ms: DEFAULT_IDLE_FLOOR_MS,
        }
    }
}

/// Live outputs driven while the key is held.
pub trait KeyerOutputs: Send + Sync + 'static {
    fn key_down(&self);
    fn key_up(&self);
    /// Stop everything immediately.
    fn cut(&self, reason: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopKeyerOutputs;

impl KeyerOutputs for NoopKeyerOutputs {
    fn key_down(&self) {}
    fn key_up(&self) {}
    fn cut(&self, _reason: &str) {}
}

#[derive(Debug, Clone, Copy)]
struct KeyerOptions {
    unit_ms: f64,
    tolerance: Tolerance,
}

impl From<&SettingsSnapshot> for KeyerOptions {
    fn from(settings: &SettingsSnapshot) -> Self {
        Self {
            unit_ms: settings.timing().unit_ms(),
            tolerance: settings.tolerance(),
        }
    }
}

struct Inner {
    options: KeyerOptions,
    session: Option<Session>,
}

struct Shared {
    clock: SharedClock,
    config: KeyerConfig,
    outputs: Arc<dyn KeyerOutputs>,
    inner: Mutex<Inner>,
    timers: Generation,
    verdict_tx: broadcast::Sender<VerdictEvent>,
    next_session: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    IdleTimeout,
    Watchdog,
}

/// Turns press/release timestamps into verdicts against an expected pattern.
#[derive(Clone)]
pub struct Keyer {
    shared: Arc<Shared>,
}

impl Keyer {
    pub fn new(
        clock: SharedClock,
        config: KeyerConfig,
        settings: &SettingsSnapshot,
        outputs: Arc<dyn KeyerOutputs>,
    ) -> Self {
        let (verdict_tx, _) = broadcast::channel(VERDICT_CAP);
        Self {
            shared: Arc::new(Shared {
                clock,
                config,
                outputs,
                inner: Mutex::new(Inner {
                    options: KeyerOptions::from(settings),
                    session: None,
                }),
                timers: Generation::new(),
                verdict_tx,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<VerdictEvent> {
        self.shared.verdict_tx.subscribe()
    }

    /// Start a new session, replacing any current one.
    pub fn start_session(&self, mode: KeyerMode) -> u64 {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        self.shared.timers.advance();
        let mut inner = self.shared.inner.lock();
        let unit_ms = inner.options.unit_ms;
        if inner.session.replace(Session::new(id, mode, unit_ms)).is_some() {
            self.shared.outputs.cut("session replaced");
        }
        info!(session_id = id, ?mode, "keyer session started");
        id
    }

    /// Arm the next attempt. Starts a practice session if none is active.
    ///
    /// # Errors
    /// `NoActiveSession` if the current challenge session has already ended.
    pub fn begin_attempt(&self, expected: Pattern) -> Result<u32> {
        if self.shared.inner.lock().session.is_none() {
            self.start_session(KeyerMode::Practice);
        }
        self.shared.timers.advance();
        let mut inner = self.shared.inner.lock();
        let unit_ms = inner.options.unit_ms;
        let session = inner.session.as_mut().ok_or(CadenceError::NoActiveSession)?;
        if session.ended {
            return Err(CadenceError::NoActiveSession);
        }
        if session.state == KeyerState::Pressing {
            self.shared.outputs.key_up();
        }
        let attempt = session.arm(expected, unit_ms);
        debug!(session_id = session.id, attempt, expected = %session.expected, "attempt armed");
        Ok(attempt)
    }

    /// Key pressed. `ts_ms` may be monotonic or Unix-epoch milliseconds;
    /// `None` means now. Ignored unless an attempt is armed.
    pub fn press_start(&self, ts_ms: Option<f64>) {
        self.shared.press_start(ts_ms);
    }

    /// Key released.
    ///
    /// # Errors
    /// `InvalidPressWindow` if the release precedes the press.
    pub fn press_end(&self, ts_ms: Option<f64>) -> Result<()> {
        self.shared.press_end(ts_ms)
    }

    /// Re-derive unit and tolerances. Tolerances apply immediately, the
    /// unit from the next attempt.
    pub fn update_options(&self, settings: &SettingsSnapshot) {
        self.shared.inner.lock().options = KeyerOptions::from(settings);
    }

    pub fn cut_active_outputs(&self, reason: &str) {
        self.shared.outputs.cut(reason);
    }

    /// Drop the session and every pending timer.
    pub fn reset(&self) {
        self.shared.timers.advance();
        let dropped = self.shared.inner.lock().session.take();
        if let Some(session) = dropped {
            debug!(session_id = session.id, "keyer session reset");
        }
        self.shared.outputs.cut("keyer reset");
    }

    /// End the session and return its tally.
    pub fn end_session(&self) -> Option<ScoreSummary> {
        self.shared.timers.advance();
        let session = self.shared.inner.lock().session.take()?;
        self.shared.outputs.cut("session ended");
        Some(session.summary(false))
    }

    pub fn state(&self) -> KeyerState {
        self.shared
            .inner
            .lock()
            .session
            .as_ref()
            .map_or(KeyerState::Idle, |s| s.state)
    }

    pub fn session(&self) -> Option<KeyerSessionState> {
        self.shared.inner.lock().session.as_ref().map(Session::view)
    }

    /// Idle timeout after a partial match, for `unit_ms`.
    pub fn idle_timeout_ms(&self, unit_ms: f64) -> f64 {
        (unit_ms * IDLE_TIMEOUT_UNITS).max(self.shared.config.idle_floor_ms)
    }
}

impl std::fmt::Debug for Keyer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn press_start(self: &Arc<Self>, ts_ms: Option<f64>) {
        let ts = self.clock.normalize_timestamp(ts_ms);
        let mut inner = self.inner.lock();
        let options = inner.options;
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        match session.state {
            KeyerState::Idle => {
                debug!("press ignored: not armed");
                return;
            }
            KeyerState::Pressing => {
                debug!("press ignored: already pressing");
                return;
            }
            KeyerState::Armed | KeyerState::Released => {}
        }

        if !session.accumulated.is_empty() {
            if let Some(released_at) = session.last_release_at {
                let gap_ms = ts - released_at;
                let gap = classify_gap(gap_ms, session.unit_ms, options.tolerance.gap);
                if gap != Some(MorseGap::Intra) {
                    debug!(gap_ms, ?gap, "gap inside character was not intra");
                    self.resolve(session, Verdict::Wrong, VerdictReason::BadGap, ts);
                    return;
                }
            }
        }

        session.press_started_at = Some(ts);
        session.state = KeyerState::Pressing;
        let token = self.timers.advance();
        let (session_id, attempt) = (session.id, session.attempt);
        drop(inner);

        self.outputs.key_down();
        self.arm_timer(TimerKind::Watchdog, token, session_id, attempt, self.config.watchdog_ms);
    }

    fn press_end(self: &Arc<Self>, ts_ms: Option<f64>) -> Result<()> {
        let ts = self.clock.normalize_timestamp(ts_ms);
        let mut inner = self.inner.lock();
        let options = inner.options;
        let Some(session) = inner.session.as_mut() else {
            return Ok(());
        };
        if session.state != KeyerState::Pressing {
            debug!(state = ?session.state, "release ignored");
            return Ok(());
        }
        let Some(started_at) = session.press_started_at else {
            return Ok(());
        };
        let window = PressWindow::new(started_at, ts)?;

        self.timers.advance();
        self.outputs.key_up();
        session.press_started_at = None;
        session.last_release_at = Some(ts);
        session.state = KeyerState::Released;

        let Some(symbol) = classify_signal(window.duration_ms(), session.unit_ms, options.tolerance.signal) else {
            debug!(duration_ms = window.duration_ms(), "press fits neither dot nor dash");
            self.resolve(session, Verdict::Wrong, VerdictReason::UnclassifiedPress, ts);
            return Ok(());
        };
        session.accumulated.push(symbol);

        if !session.accumulated.is_prefix_of(&session.expected) {
            self.resolve(session, Verdict::Wrong, VerdictReason::Mismatch, ts);
        } else if session.accumulated.len() == session.expected.len() {
            self.resolve(session, Verdict::Correct, VerdictReason::Matched, ts);
        } else {
            let idle_ms = (session.unit_ms * IDLE_TIMEOUT_UNITS).max(self.config.idle_floor_ms);
            let token = self.timers.current();
            let (session_id, attempt) = (session.id, session.attempt);
            drop(inner);
            self.arm_timer(TimerKind::IdleTimeout, token, session_id, attempt, idle_ms);
        }
        Ok(())
    }

    fn resolve(&self, session: &mut Session, verdict: Verdict, reason: VerdictReason, at_ms: f64) {
        self.timers.advance();
        let received = session.accumulated.to_string();
        let summary = session.tally(verdict);
        let event = VerdictEvent {
            session_id: session.id,
            attempt: session.attempt,
            verdict,
            reason,
            expected: session.expected.to_string(),
            received,
            lives_remaining: session.lives_remaining,
            at_ms,
            summary,
        };
        info!(
            session_id = event.session_id,
            attempt = event.attempt,
            ?verdict,
            ?reason,
            "keyer verdict"
        );
        if let Some(summary) = &event.summary {
            info!(score = summary.score, attempts = summary.attempts, "challenge finished");
        }
        let _ = self.verdict_tx.send(event);
    }

    fn arm_timer(self: &Arc<Self>, kind: TimerKind, token: u64, session_id: u64, attempt: u32, after_ms: f64) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(?kind, "no async runtime; keyer timer not armed");
                return;
            }
        };
        let shared = Arc::clone(self);
        let deadline = tokio::time::Instant::now() + Duration::from_micros((after_ms.max(0.0) * 1000.0) as u64);
        handle.spawn(async move {
            if !shared.timers.sleep_until(token, deadline).await {
                return;
            }
            shared.fire_timer(kind, token, session_id, attempt);
        });
    }

    fn fire_timer(&self, kind: TimerKind, token: u64, session_id: u64, attempt: u32) {
        let mut inner = self.inner.lock();
        if !self.timers.is_current(token) {
            return;
        }
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        if session.id != session_id || session.attempt != attempt {
            return;
        }
        let now = self.clock.now_ms();
        match (kind, session.state) {
            (TimerKind::IdleTimeout, KeyerState::Released) => {
                self.resolve(session, Verdict::Timeout, VerdictReason::IdleTimeout, now);
            }
            (TimerKind::Watchdog, KeyerState::Pressing) => {
                warn!(session_id, attempt, "key held past watchdog; forcing release");
                self.outputs.key_up();
                self.resolve(session, Verdict::Wrong, VerdictReason::StuckKey, now);
            }
            _ => {}
        }
    }
}
