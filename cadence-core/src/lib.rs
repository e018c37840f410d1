//! # cadence-core
//!
//! Morse timing and output synchronization engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! Pattern ─► PlaybackScheduler ─► ToneOutput (BackendChain: low-latency → stream → virtual)
//!                  │  Scheduled / Actual reports, reconciled per sequence
//!                  ▼
//!           on_symbol(ctx) ─► OutputDispatcher ─► haptic / flash / torch
//!                  │                                   │
//!                  └────────────► LatencyStore ◄───────┘
//!
//! press_start / press_end ─► Keyer ─► classify ─► VerdictEvent broadcast
//! ```
//!
//! Every timestamp lives on one monotonic timeline supplied by `Clock`.
//! Cancellation is a generation token: stale waits give up silently.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod clock;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod keyer;
pub mod output;
pub mod playback;
pub mod settings;
pub mod timing;
pub mod tone;

// Convenience re-exports for downstream crates
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, TokioClock};
pub use diagnostics::{ChannelSnapshot, LatencyStore, TimingAnomaly};
pub use engine::{CadenceEngine, EngineComponents, EngineConfig};
pub use error::{CadenceError, Result};
pub use ipc::events::{
    PlaybackStatus, PlaybackStatusEvent, ScoreSummary, SymbolEvent, SymbolEventKind, Verdict, VerdictEvent,
    VerdictReason,
};
pub use keyer::{Keyer, KeyerMode, KeyerState};
pub use output::{OutputChannel, OutputDispatcher, OutputDrivers};
pub use playback::{PlaybackOutcome, PlaybackScheduler, SchedulerConfig};
pub use settings::SettingsSnapshot;
pub use timing::{MorseGap, MorseSymbol, Pattern, TimingModel, Tolerance};
pub use tone::{BackendChain, BackendKind, ChannelState, ToneOutput};
