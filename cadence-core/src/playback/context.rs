//! Timing records attached to every dispatched symbol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::timing::MorseSymbol;

/// Distinguishes a callback fired ahead of backend confirmation from one
/// fired on (or synthesized at) confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPhase {
    Scheduled,
    Actual,
}

/// Opaque token joining one playback across scheduler, dispatcher and
/// diagnostics records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackCorrelation {
    pub id: String,
    pub source: String,
    pub started_at_ms: f64,
}

/// Issues correlation ids. Ids are unique within the process; their
/// structure is not part of any contract.
#[derive(Debug)]
pub struct CorrelationIds {
    scope: u64,
    next: AtomicU64,
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

impl CorrelationIds {
    pub fn new() -> Self {
        Self {
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            next: AtomicU64::new(1),
        }
    }

    pub fn issue(&self, source: &str, started_at_ms: f64) -> PlaybackCorrelation {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        PlaybackCorrelation {
            id: format!("pb-{:x}-{}-{n}", std::process::id(), self.scope),
            source: source.to_owned(),
            started_at_ms,
        }
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Full timing record for one dispatched symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolContext {
    /// When the symbol was planned to start (monotonic ms).
    pub requested_at_ms: f64,
    pub correlation_id: String,
    /// Which path produced the event: `"timer"`, or the backend name.
    pub source: String,
    pub generation: u64,
    /// Position of the symbol within the playback.
    pub index: usize,
    pub backend_timestamp_ms: Option<f64>,
    pub backend_duration_ms: Option<f64>,
    pub sequence: Option<u32>,
    /// `backend_timestamp_ms - requested_at_ms`.
    pub offset_ms: Option<f64>,
    /// `backend_duration_ms - planned duration`.
    pub skew_ms: Option<f64>,
    pub anomaly: bool,
    pub phase: DispatchPhase,
}

impl SymbolContext {
    pub fn new(
        correlation_id: impl Into<String>,
        source: impl Into<String>,
        generation: u64,
        index: usize,
        requested_at_ms: f64,
        phase: DispatchPhase,
    ) -> Self {
        Self {
            requested_at_ms,
            correlation_id: correlation_id.into(),
            source: source.into(),
            generation,
            index,
            backend_timestamp_ms: None,
            backend_duration_ms: None,
            sequence: None,
            offset_ms: None,
            skew_ms: None,
            anomaly: false,
            phase,
        }
    }

    /// Fill in backend-observed timing. Returns `true` if the offset crosses
    /// `anomaly_threshold_ms`.
    pub fn apply_backend_timing(
        &mut self,
        backend_timestamp_ms: f64,
        backend_duration_ms: Option<f64>,
        planned_duration_ms: f64,
        anomaly_threshold_ms: f64,
    ) -> bool {
        let offset = backend_timestamp_ms - self.requested_at_ms;
        self.backend_timestamp_ms = Some(backend_timestamp_ms);
        self.backend_duration_ms = backend_duration_ms;
        self.offset_ms = Some(offset);
        self.skew_ms = backend_duration_ms.map(|d| d - planned_duration_ms);
        self.anomaly = offset.abs() > anomaly_threshold_ms;
        self.anomaly
    }
}

/// Context shared between the scheduler and whoever received the callback.
///
/// The scheduler back-fills backend timing into an already delivered
/// context through this handle; receivers read it with `snapshot`.
#[derive(Debug, Clone)]
pub struct SharedSymbolContext(Arc<RwLock<SymbolContext>>);

impl SharedSymbolContext {
    pub fn new(ctx: SymbolContext) -> Self {
        Self(Arc::new(RwLock::new(ctx)))
    }

    pub fn snapshot(&self) -> SymbolContext {
        self.0.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SymbolContext) -> R) -> R {
        f(&mut self.0.write())
    }
}

/// Lifecycle of a symbol announced by the backend ahead of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Dispatched,
    Actualized,
}

/// A symbol queued ahead of backend confirmation.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub sequence: u32,
    pub symbol: MorseSymbol,
    pub duration_ms: f64,
    /// Backend-expected start on the monotonic timeline.
    pub fire_at_ms: f64,
    pub state: EntryState,
    pub context: Option<SharedSymbolContext>,
}

impl ScheduledEntry {
    pub fn pending(sequence: u32, symbol: MorseSymbol, duration_ms: f64, fire_at_ms: f64) -> Self {
        Self {
            sequence,
            symbol,
            duration_ms,
            fire_at_ms,
            state: EntryState::Pending,
            context: None,
        }
    }
}
