//! Event types broadcast by the engine to host frontends.
//!
//! ## Channel names
//!
//! | Event | Channel |
//! |-------|---------|
//! | `SymbolEvent` | `"cadence://symbol"` |
//! | `VerdictEvent` | `"cadence://verdict"` |
//! | `PlaybackStatusEvent` | `"cadence://playback"` |
//! | `ChannelSnapshot` | `"cadence://diagnostics"` (pull, see `diagnostics`) |

use serde::{Deserialize, Serialize};

use crate::playback::{DispatchPhase, SymbolContext};
use crate::timing::MorseSymbol;

pub use crate::diagnostics::ChannelSnapshot;

pub const SYMBOL_CHANNEL: &str = "cadence://symbol";
pub const VERDICT_CHANNEL: &str = "cadence://verdict";
pub const PLAYBACK_CHANNEL: &str = "cadence://playback";
pub const DIAGNOSTICS_CHANNEL: &str = "cadence://diagnostics";

// ---------------------------------------------------------------------------
// Symbol events
// ---------------------------------------------------------------------------

/// Whether a symbol event starts a symbol or reports timing learned later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SymbolEventKind {
    #[default]
    Dispatch,
    /// Backend confirmation for a symbol already dispatched ahead of time.
    /// Same correlation id and index as the original dispatch.
    TimingUpdate,
}

/// One symbol event. `Dispatch` events match dispatcher fan-out one to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolEvent {
    #[serde(default)]
    pub kind: SymbolEventKind,
    pub correlation_id: String,
    pub symbol: MorseSymbol,
    pub duration_ms: f64,
    pub index: usize,
    pub phase: DispatchPhase,
    pub source: String,
    pub requested_at_ms: f64,
    pub backend_timestamp_ms: Option<f64>,
    pub offset_ms: Option<f64>,
    pub anomaly: bool,
}

impl SymbolEvent {
    pub fn new(symbol: MorseSymbol, duration_ms: f64, ctx: &SymbolContext) -> Self {
        Self {
            kind: SymbolEventKind::Dispatch,
            correlation_id: ctx.correlation_id.clone(),
            symbol,
            duration_ms,
            index: ctx.index,
            phase: ctx.phase,
            source: ctx.source.clone(),
            requested_at_ms: ctx.requested_at_ms,
            backend_timestamp_ms: ctx.backend_timestamp_ms,
            offset_ms: ctx.offset_ms,
            anomaly: ctx.anomaly,
        }
    }

    /// Follow-up for a back-filled context. Always phase `Actual`.
    pub fn timing_update(symbol: MorseSymbol, duration_ms: f64, ctx: &SymbolContext) -> Self {
        Self {
            kind: SymbolEventKind::TimingUpdate,
            phase: DispatchPhase::Actual,
            ..Self::new(symbol, duration_ms, ctx)
        }
    }
}

// ---------------------------------------------------------------------------
// Keyer verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Wrong,
    /// Partial input left idle too long. Counts as wrong.
    Timeout,
}

impl Verdict {
    pub fn is_correct(self) -> bool {
        matches!(self, Verdict::Correct)
    }
}

/// Why an attempt resolved the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerdictReason {
    Matched,
    /// Received symbols diverged from the expected pattern.
    Mismatch,
    /// Press duration fit neither a dot nor a dash.
    UnclassifiedPress,
    /// Gap between presses inside one character was not an intra gap.
    BadGap,
    IdleTimeout,
    /// Key held past the watchdog limit.
    StuckKey,
}

/// Final tally of a challenge session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    /// Correct answers.
    pub score: u32,
    pub attempts: u32,
    pub wrong: u32,
    pub planned_total: u32,
    pub lives_remaining: u32,
    /// `true` when the session ended because lives ran out.
    pub ended_early: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictEvent {
    pub session_id: u64,
    pub attempt: u32,
    pub verdict: Verdict,
    pub reason: VerdictReason,
    /// Expected pattern in `.`/`-` form.
    pub expected: String,
    pub received: String,
    pub lives_remaining: Option<u32>,
    pub at_ms: f64,
    /// Present on the verdict that ends a challenge session.
    pub summary: Option<ScoreSummary>,
}

// ---------------------------------------------------------------------------
// Playback status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Completed,
    Cancelled,
    /// Audio is enabled but no tone backend could be constructed.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatusEvent {
    pub status: PlaybackStatus,
    pub correlation_id: Option<String>,
    pub generation: u64,
    pub at_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_event_serializes_with_camel_case_and_lowercase_enums() {
        let mut ctx = SymbolContext::new("pb-1", "stream", 3, 2, 100.0, DispatchPhase::Scheduled);
        ctx.apply_backend_timing(112.0, Some(300.0), 300.0, 80.0);
        let event = SymbolEvent::new(MorseSymbol::Dash, 300.0, &ctx);
        let json = serde_json::to_value(&event).expect("serialize symbol event");
        assert_eq!(json["correlationId"], "pb-1");
        assert_eq!(json["symbol"], "dash");
        assert_eq!(json["phase"], "scheduled");
        assert_eq!(json["durationMs"], 300.0);
        assert_eq!(json["offsetMs"], 12.0);
        assert_eq!(json["anomaly"], false);
        assert_eq!(json["kind"], "dispatch");
    }

    #[test]
    fn timing_update_keeps_identity_and_reports_actual() {
        let mut ctx = SymbolContext::new("pb-2", "stream", 1, 4, 400.0, DispatchPhase::Scheduled);
        ctx.apply_backend_timing(409.0, Some(100.0), 100.0, 80.0);
        let event = SymbolEvent::timing_update(MorseSymbol::Dot, 100.0, &ctx);
        assert_eq!(event.kind, SymbolEventKind::TimingUpdate);
        assert_eq!(event.phase, DispatchPhase::Actual);
        assert_eq!(event.correlation_id, "pb-2");
        assert_eq!(event.index, 4);
        assert_eq!(event.offset_ms, Some(9.0));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["kind"], "timingUpdate");
    }

    #[test]
    fn symbol_event_without_kind_reads_as_dispatch() {
        let ctx = SymbolContext::new("pb-3", "timer", 1, 0, 0.0, DispatchPhase::Actual);
        let mut json = serde_json::to_value(SymbolEvent::new(MorseSymbol::Dot, 50.0, &ctx)).expect("serialize");
        json.as_object_mut().expect("object").remove("kind");
        let back: SymbolEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.kind, SymbolEventKind::Dispatch);
    }

    #[test]
    fn verdict_event_carries_summary_when_session_ends() {
        let event = VerdictEvent {
            session_id: 7,
            attempt: 4,
            verdict: Verdict::Timeout,
            reason: VerdictReason::IdleTimeout,
            expected: "-.-".into(),
            received: "-.".into(),
            lives_remaining: Some(0),
            at_ms: 4_200.0,
            summary: Some(ScoreSummary {
                score: 1,
                attempts: 4,
                wrong: 3,
                planned_total: 10,
                lives_remaining: 0,
                ended_early: true,
            }),
        };
        let json = serde_json::to_value(&event).expect("serialize verdict");
        assert_eq!(json["verdict"], "timeout");
        assert_eq!(json["reason"], "idleTimeout");
        assert_eq!(json["livesRemaining"], 0);
        assert_eq!(json["summary"]["plannedTotal"], 10);
        assert_eq!(json["summary"]["endedEarly"], true);
        let back: VerdictEvent = serde_json::from_value(json).expect("deserialize verdict");
        assert_eq!(back, event);
    }

    #[test]
    fn playback_status_rejects_non_lowercase_values() {
        let parsed = serde_json::from_str::<PlaybackStatus>("\"Playing\"");
        assert!(parsed.is_err());
        let ok: PlaybackStatus = serde_json::from_str("\"unavailable\"").expect("lowercase");
        assert_eq!(ok, PlaybackStatus::Unavailable);
    }
}
