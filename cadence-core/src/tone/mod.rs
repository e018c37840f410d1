//! Tone backends.
//!
//! The `ToneController` trait decouples the scheduler from any specific
//! audio technology. Backends are discovered through `BackendProbe`s, tried
//! in priority order by `BackendChain`:
//!
//! | Priority | Backend | Probe |
//! |----------|---------|-------|
//! | 1 | `LowLatency`: cpal stream, small fixed buffer, sample-accurate sequencing | platform gate + device buffer range + override |
//! | 2 | `Stream`: cpal stream, default buffer, sample-accurate sequencing | build the output stream |
//! | 3 | `Virtual`: silent, clock-driven | always available |
//!
//! Normal absence of a backend is a `None` from its probe, never an error.
//! `ToneOutput` owns the selected controller for its whole lifetime.

pub mod chain;
#[cfg(feature = "audio-cpal")]
pub mod native;
pub mod sidetone;
pub mod virtual_tone;

use std::fmt;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::playback::DispatchPhase;
use crate::timing::{MorseSymbol, Pattern, TimingModel};

pub use chain::{BackendChain, ChannelState, ToneOutput};
pub use virtual_tone::{VirtualProbe, VirtualTone};

#[cfg(feature = "audio-cpal")]
pub use native::{LowLatencyProbe, NativeTone, StreamProbe};

/// Which technology a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    LowLatency,
    Stream,
    Virtual,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::LowLatency => "low-latency",
            BackendKind::Stream => "stream",
            BackendKind::Virtual => "virtual",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One symbol of a sequenced plan, relative to the plan start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedSymbol {
    pub sequence: u32,
    pub symbol: MorseSymbol,
    pub offset_ms: f64,
    pub duration_ms: f64,
}

impl PlannedSymbol {
    pub fn end_ms(&self) -> f64 {
        self.offset_ms + self.duration_ms
    }
}

/// Tone/silence layout of one pattern: symbols at canonical lengths with a
/// one-unit gap between them.
#[derive(Debug, Clone, PartialEq)]
pub struct TonePlan {
    pub hz: f32,
    pub symbols: Vec<PlannedSymbol>,
    /// How far ahead of each symbol the backend should announce it.
    pub lead_ms: f64,
}

impl TonePlan {
    pub fn from_pattern(pattern: &Pattern, unit_ms: f64, hz: f32, lead_ms: f64) -> Self {
        let timing = TimingModel::from_unit_ms(unit_ms);
        let gap = timing.unit_ms();
        let mut offset = 0.0;
        let symbols = pattern
            .symbols()
            .iter()
            .enumerate()
            .map(|(i, &symbol)| {
                let duration_ms = timing.symbol_ms(symbol);
                let planned = PlannedSymbol {
                    sequence: i as u32,
                    symbol,
                    offset_ms: offset,
                    duration_ms,
                };
                offset += duration_ms + gap;
                planned
            })
            .collect();
        Self {
            hz,
            symbols,
            lead_ms,
        }
    }

    /// End of the last tone, relative to the plan start.
    pub fn total_ms(&self) -> f64 {
        self.symbols.last().map(PlannedSymbol::end_ms).unwrap_or(0.0)
    }

    pub fn get(&self, sequence: u32) -> Option<&PlannedSymbol> {
        self.symbols.get(sequence as usize)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Backend-side timing report for one sequenced symbol.
///
/// `Scheduled` reports carry the expected start; `Actual` reports carry the
/// observed start. Both are on the engine's monotonic timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendReport {
    pub sequence: u32,
    pub phase: DispatchPhase,
    pub timestamp_ms: f64,
    pub duration_ms: Option<f64>,
}

/// Contract every tone backend implements.
///
/// `&mut self` everywhere: exactly one owner (`ToneOutput`) drives a
/// controller at a time.
pub trait ToneController: Send + 'static {
    fn kind(&self) -> BackendKind;

    /// Warm up for `hz` without sounding.
    fn prepare(&mut self, hz: f32) -> Result<()>;

    /// Key down. `None` keeps the current frequency.
    fn start(&mut self, hz: Option<f32>) -> Result<()>;

    /// Key up.
    fn stop(&mut self) -> Result<()>;

    /// Release every resource. Idempotent; the controller is unusable after.
    fn teardown(&mut self);

    fn current_hz(&self) -> Option<f32>;

    fn set_volume(&mut self, _gain: f32) -> Result<()> {
        Ok(())
    }

    /// Hand a whole plan to the backend for sample-accurate playback.
    ///
    /// Returns `Ok(None)` when the backend cannot sequence; the scheduler
    /// then keys it with timers. The receiver yields `Scheduled` reports
    /// `plan.lead_ms` ahead of each symbol and `Actual` reports as each one
    /// starts sounding.
    fn sequence(&mut self, _plan: &TonePlan) -> Result<Option<Receiver<BackendReport>>> {
        Ok(None)
    }

    /// Abort a running sequence and silence the output.
    fn cancel_sequence(&mut self) -> Result<()> {
        self.stop()
    }
}

/// Everything a probe needs to build a controller.
#[derive(Clone)]
pub struct ProbeContext {
    pub clock: SharedClock,
    pub hz: f32,
    pub gain: f32,
    /// `Some(true)` force-enables the low-latency backend, `Some(false)`
    /// force-disables it, `None` leaves it to the platform gate.
    pub low_latency_override: Option<bool>,
    /// Fixed buffer size requested by the low-latency backend.
    pub low_latency_frames: u32,
}

impl fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeContext")
            .field("hz", &self.hz)
            .field("gain", &self.gain)
            .field("low_latency_override", &self.low_latency_override)
            .field("low_latency_frames", &self.low_latency_frames)
            .finish_non_exhaustive()
    }
}

/// Capability-probing strategy for one backend.
pub trait BackendProbe: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Build a controller, or `None` if the backend is unavailable here.
    fn probe(&self, ctx: &ProbeContext) -> Option<Box<dyn ToneController>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_lays_out_symbols_with_unit_gaps() {
        let k = Pattern::parse("-.-").unwrap();
        let plan = TonePlan::from_pattern(&k, 100.0, 600.0, 64.0);
        let layout: Vec<(f64, f64)> = plan
            .symbols
            .iter()
            .map(|s| (s.offset_ms, s.duration_ms))
            .collect();
        assert_eq!(layout, vec![(0.0, 300.0), (400.0, 100.0), (600.0, 300.0)]);
        assert_eq!(plan.total_ms(), 900.0);
        assert_eq!(plan.get(1).map(|s| s.symbol), Some(MorseSymbol::Dot));
    }

    #[test]
    fn empty_pattern_has_empty_plan() {
        let plan = TonePlan::from_pattern(&Pattern::default(), 100.0, 600.0, 64.0);
        assert!(plan.is_empty());
        assert_eq!(plan.total_ms(), 0.0);
    }
}
