//! Keyer session state and scoring.

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::ipc::events::{ScoreSummary, Verdict};
use crate::timing::Pattern;

/// One recorded press, on the monotonic timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressWindow {
    start_ms: f64,
    end_ms: f64,
}

impl PressWindow {
    /// # Errors
    /// `InvalidPressWindow` when `end_ms` precedes `start_ms`.
    pub fn new(start_ms: f64, end_ms: f64) -> Result<Self> {
        if end_ms < start_ms || !start_ms.is_finite() || !end_ms.is_finite() {
            return Err(CadenceError::InvalidPressWindow { start_ms, end_ms });
        }
        Ok(Self { start_ms, end_ms })
    }

    pub fn start_ms(&self) -> f64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> f64 {
        self.end_ms
    }

    pub fn duration_ms(&self) -> f64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyerState {
    /// No attempt armed; presses are ignored.
    Idle,
    /// Attempt armed, waiting for the first press.
    Armed,
    Pressing,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum KeyerMode {
    Practice,
    /// Ends early once `lives` wrong answers have been given.
    Challenge { lives: u32, planned_total: u32 },
}

/// Public view of the active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyerSessionState {
    pub session_id: u64,
    pub state: KeyerState,
    pub armed: bool,
    pub attempt: u32,
    pub expected: Pattern,
    pub press_started_at: Option<f64>,
    pub last_release_at: Option<f64>,
    pub accumulated_symbols: Pattern,
    pub lives_remaining: Option<u32>,
    pub unit_ms: f64,
    pub ended: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub id: u64,
    pub mode: KeyerMode,
    pub state: KeyerState,
    pub attempt: u32,
    pub expected: Pattern,
    pub accumulated: Pattern,
    pub press_started_at: Option<f64>,
    pub last_release_at: Option<f64>,
    /// Unit for the current attempt. Speed changes apply from the next one.
    pub unit_ms: f64,
    pub lives_remaining: Option<u32>,
    pub correct: u32,
    pub wrong: u32,
    pub attempts: u32,
    pub ended: bool,
}

impl Session {
    pub fn new(id: u64, mode: KeyerMode, unit_ms: f64) -> Self {
        let lives_remaining = match mode {
            KeyerMode::Practice => None,
            KeyerMode::Challenge { lives, .. } => Some(lives.max(1)),
        };
        Self {
            id,
            mode,
            state: KeyerState::Idle,
            attempt: 0,
            expected: Pattern::default(),
            accumulated: Pattern::default(),
            press_started_at: None,
            last_release_at: None,
            unit_ms,
            lives_remaining,
            correct: 0,
            wrong: 0,
            attempts: 0,
            ended: false,
        }
    }

    pub fn arm(&mut self, expected: Pattern, unit_ms: f64) -> u32 {
        self.attempt += 1;
        self.expected = expected;
        self.accumulated.clear();
        self.press_started_at = None;
        self.last_release_at = None;
        self.unit_ms = unit_ms;
        self.state = KeyerState::Armed;
        self.attempt
    }

    pub fn is_armed(&self) -> bool {
        matches!(
            self.state,
            KeyerState::Armed | KeyerState::Pressing | KeyerState::Released
        )
    }

    /// Count a verdict. Returns the final summary if this verdict ends a
    /// challenge session.
    pub fn tally(&mut self, verdict: Verdict) -> Option<ScoreSummary> {
        self.state = KeyerState::Idle;
        self.press_started_at = None;
        self.attempts += 1;
        if verdict.is_correct() {
            self.correct += 1;
        } else {
            self.wrong += 1;
            if let Some(lives) = self.lives_remaining.as_mut() {
                *lives = lives.saturating_sub(1);
            }
        }
        let KeyerMode::Challenge { planned_total, .. } = self.mode else {
            return None;
        };
        let out_of_lives = self.lives_remaining == Some(0);
        if out_of_lives || self.attempts >= planned_total {
            self.ended = true;
            return Some(self.summary(out_of_lives));
        }
        None
    }

    pub fn summary(&self, ended_early: bool) -> ScoreSummary {
        let planned_total = match self.mode {
            KeyerMode::Challenge { planned_total, .. } => planned_total,
            KeyerMode::Practice => self.attempts,
        };
        ScoreSummary {
            score: self.correct,
            attempts: self.attempts,
            wrong: self.wrong,
            planned_total,
            lives_remaining: self.lives_remaining.unwrap_or(0),
            ended_early,
        }
    }

    pub fn view(&self) -> KeyerSessionState {
        KeyerSessionState {
            session_id: self.id,
            state: self.state,
            armed: self.is_armed(),
            attempt: self.attempt,
            expected: self.expected.clone(),
            press_started_at: self.press_started_at,
            last_release_at: self.last_release_at,
            accumulated_symbols: self.accumulated.clone(),
            lives_remaining: self.lives_remaining,
            unit_ms: self.unit_ms,
            ended: self.ended,
        }
    }
}
