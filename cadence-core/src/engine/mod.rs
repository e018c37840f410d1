//! `CadenceEngine`: top-level facade wiring the components together.
//!
//! ## Ownership
//!
//! ```text
//! CadenceEngine
//!   ├─ ToneOutput (Arc<Mutex>) ◄──── PlaybackScheduler
//!   │        ▲                              │ on_symbol
//!   │        │ key_down / key_up            ▼
//!   │     LiveOutputs ◄── Keyer      OutputDispatcher ──► SymbolEvent broadcast
//!   │        │                              │
//!   └────────┴──────────► LatencyStore ◄────┘
//! ```
//!
//! One playback and one keyer session at a time. Playback calls are async
//! and must run on a tokio runtime; the keyer arms its timers on whichever
//! runtime is current when a press arrives.
//!
//! ## Threading
//!
//! The native tone stream is `!Send` on some hosts, so `ToneOutput` never
//! holds it directly: native controllers own a dedicated audio thread and
//! talk to it over channels. Everything here is `Send + Sync`.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::clock::{MonotonicClock, SharedClock};
use crate::diagnostics::{ChannelSnapshot, LatencyStore, TimingAnomaly, DEFAULT_CHANNEL_CAPACITY};
use crate::error::Result;
use crate::ipc::events::{PlaybackStatusEvent, ScoreSummary, SymbolEvent, VerdictEvent};
use crate::keyer::{Keyer, KeyerConfig, KeyerMode, KeyerOutputs, KeyerSessionState};
use crate::output::{DispatcherOptions, OutputChannel, OutputDispatcher, OutputDrivers};
use crate::playback::{
    PlaybackOutcome, PlaybackScheduler, SchedulerConfig, SharedSymbolContext,
    DEFAULT_POLL_INTERVAL_MS,
};
use crate::settings::SettingsSnapshot;
use crate::timing::{MorseGap, MorseSymbol, Pattern};
use crate::tone::{BackendChain, ChannelState, ProbeContext, ToneOutput};

/// Symbol events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Fixed buffer requested by the low-latency backend, in frames.
pub const DEFAULT_LOW_LATENCY_FRAMES: u32 = 128;

/// Lives granted to a challenge session.
pub const DEFAULT_CHALLENGE_LIVES: u32 = 3;

/// Configuration for `CadenceEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    /// `Some(true)` forces the low-latency backend past the platform gate,
    /// `Some(false)` disables it. `None` defers to `CADENCE_LOW_LATENCY`,
    /// then the platform gate.
    pub low_latency_override: Option<bool>,
    pub low_latency_frames: u32,
    /// Samples kept per diagnostics channel. Default: 200.
    pub diagnostics_capacity: usize,
    /// Tag stamped on every latency sample.
    pub device_tag: String,
    pub keyer: KeyerConfig,
    pub challenge_lives: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut scheduler = SchedulerConfig::default();
        scheduler.poll_interval_ms = scheduler_poll_ms();
        Self {
            scheduler,
            low_latency_override: None,
            low_latency_frames: DEFAULT_LOW_LATENCY_FRAMES,
            diagnostics_capacity: DEFAULT_CHANNEL_CAPACITY,
            device_tag: default_device_tag(),
            keyer: KeyerConfig::default(),
            challenge_lives: DEFAULT_CHALLENGE_LIVES,
        }
    }
}

fn default_device_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn env_low_latency() -> Option<bool> {
    static LOW_LATENCY: OnceLock<Option<bool>> = OnceLock::new();
    *LOW_LATENCY.get_or_init(|| {
        std::env::var("CADENCE_LOW_LATENCY")
            .ok()
            .and_then(|v| parse_switch(&v))
    })
}

fn scheduler_poll_ms() -> u64 {
    static POLL_MS: OnceLock<u64> = OnceLock::new();
    *POLL_MS.get_or_init(|| {
        std::env::var("CADENCE_SCHEDULER_POLL_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|v| v.clamp(1, 50))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
    })
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Replaceable parts. `Default` gives the real clock, the standard backend
/// chain and no-op platform drivers.
pub struct EngineComponents {
    pub clock: SharedClock,
    pub chain: Arc<BackendChain>,
    pub drivers: OutputDrivers,
}

impl Default for EngineComponents {
    fn default() -> Self {
        Self {
            clock: MonotonicClock::shared(),
            chain: Arc::new(BackendChain::standard()),
            drivers: OutputDrivers::default(),
        }
    }
}

/// Keyer live outputs: sidetone plus the dispatcher's visual channels.
struct LiveOutputs {
    tone: Arc<Mutex<ToneOutput>>,
    dispatcher: Arc<OutputDispatcher>,
    settings: Arc<RwLock<SettingsSnapshot>>,
}

impl KeyerOutputs for LiveOutputs {
    fn key_down(&self) {
        let (audio_enabled, hz) = {
            let settings = self.settings.read();
            (settings.audio_enabled, settings.tone_hz)
        };
        if audio_enabled {
            let mut tone = self.tone.lock();
            if tone.state() != ChannelState::Unavailable {
                let _ = tone.start(Some(hz));
            }
        }
        self.dispatcher.live_press_start();
    }

    fn key_up(&self) {
        {
            let mut tone = self.tone.lock();
            if tone.state() != ChannelState::Unavailable {
                let _ = tone.stop();
            }
        }
        self.dispatcher.live_press_end();
    }

    fn cut(&self, reason: &str) {
        self.dispatcher.cut_active_outputs(reason);
        let mut tone = self.tone.lock();
        if tone.state() != ChannelState::Unavailable {
            let _ = tone.stop();
        }
    }
}

/// The top-level engine handle.
///
/// All fields use interior mutability. Wrap in `Arc<CadenceEngine>` to share
/// between a host's command handlers and event-forwarding tasks.
pub struct CadenceEngine {
    config: EngineConfig,
    clock: SharedClock,
    settings: Arc<RwLock<SettingsSnapshot>>,
    diagnostics: Arc<LatencyStore>,
    tone: Arc<Mutex<ToneOutput>>,
    scheduler: PlaybackScheduler,
    dispatcher: Arc<OutputDispatcher>,
    keyer: Keyer,
    symbol_tx: broadcast::Sender<SymbolEvent>,
}

impl CadenceEngine {
    pub fn new(config: EngineConfig, settings: SettingsSnapshot) -> Self {
        Self::with_components(config, settings, EngineComponents::default())
    }

    pub fn with_components(config: EngineConfig, settings: SettingsSnapshot, parts: EngineComponents) -> Self {
        let settings = settings.normalized();
        let EngineComponents { clock, chain, drivers } = parts;

        let diagnostics = Arc::new(LatencyStore::with_capacity(
            Arc::clone(&clock),
            config.device_tag.clone(),
            config.diagnostics_capacity,
        ));

        let probe_ctx = ProbeContext {
            clock: Arc::clone(&clock),
            hz: settings.tone_hz,
            gain: settings.audio_gain(),
            low_latency_override: config.low_latency_override.or_else(env_low_latency),
            low_latency_frames: config.low_latency_frames,
        };
        info!(chain = ?chain.names(), "selecting tone backend");
        let tone = Arc::new(Mutex::new(ToneOutput::new(chain, probe_ctx, Arc::clone(&diagnostics))));

        let scheduler = PlaybackScheduler::new(
            config.scheduler,
            Arc::clone(&clock),
            Arc::clone(&diagnostics),
            Arc::clone(&tone),
            (&settings).into(),
        );

        let dispatcher = Arc::new(OutputDispatcher::new(
            Arc::clone(&clock),
            Arc::clone(&diagnostics),
            drivers,
            DispatcherOptions::from(&settings),
        ));

        let settings = Arc::new(RwLock::new(settings));
        let live = Arc::new(LiveOutputs {
            tone: Arc::clone(&tone),
            dispatcher: Arc::clone(&dispatcher),
            settings: Arc::clone(&settings),
        });
        let keyer = Keyer::new(Arc::clone(&clock), config.keyer, &settings.read(), live);

        let (symbol_tx, _) = broadcast::channel(BROADCAST_CAP);
        {
            let symbol_tx = symbol_tx.clone();
            scheduler.set_backfill_hook(move |symbol, duration_ms, ctx| {
                let _ = symbol_tx.send(SymbolEvent::timing_update(symbol, duration_ms, ctx));
            });
        }

        Self {
            config,
            clock,
            settings,
            diagnostics,
            tone,
            scheduler,
            dispatcher,
            keyer,
            symbol_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn settings(&self) -> SettingsSnapshot {
        self.settings.read().clone()
    }

    /// Unit length at the current speed setting.
    pub fn unit_ms(&self) -> f64 {
        self.settings.read().timing().unit_ms()
    }

    /// Push a fresh settings snapshot to every component.
    pub fn update_settings(&self, settings: SettingsSnapshot) {
        let settings = settings.normalized();
        self.scheduler.update_audio(&settings);
        self.dispatcher.update_options(&settings);
        self.keyer.update_options(&settings);
        debug!(wpm = settings.wpm, tone_hz = settings.tone_hz, "settings updated");
        *self.settings.write() = settings;
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    /// Play one pattern, fanning every symbol out to the dispatcher and the
    /// symbol broadcast.
    ///
    /// # Errors
    /// `ChannelUnavailable` when audio is enabled but no tone backend exists.
    pub async fn play_morse(&self, pattern: &Pattern, unit_ms: f64) -> Result<PlaybackOutcome> {
        self.scheduler
            .play_morse(pattern, unit_ms, |symbol, duration_ms, ctx| {
                self.on_symbol(symbol, duration_ms, ctx)
            })
            .await
    }

    pub async fn play_gap(&self, gap: MorseGap, unit_ms: f64) -> PlaybackOutcome {
        self.scheduler.play_gap(gap, unit_ms).await
    }

    pub async fn play_text(&self, text: &str, unit_ms: f64) -> Result<PlaybackOutcome> {
        self.scheduler
            .play_text(text, unit_ms, |symbol, duration_ms, ctx| {
                self.on_symbol(symbol, duration_ms, ctx)
            })
            .await
    }

    /// Cancel the current playback and silence the tone.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn dispatcher(&self) -> &Arc<OutputDispatcher> {
        &self.dispatcher
    }

    /// Symbols dispatched ahead of backend confirmation are followed by a
    /// `TimingUpdate` event once the backend reports them.
    fn on_symbol(&self, symbol: MorseSymbol, duration_ms: f64, ctx: &SharedSymbolContext) {
        let snapshot = ctx.snapshot();
        self.dispatcher.dispatch(symbol, duration_ms, &snapshot);
        let _ = self.symbol_tx.send(SymbolEvent::new(symbol, duration_ms, &snapshot));
    }

    /// Cancel playback and drop every live output: tone, torch holds, flash.
    pub fn cut_active_outputs(&self, reason: &str) {
        self.scheduler.stop();
        self.keyer.cut_active_outputs(reason);
    }

    // ── Keyer ────────────────────────────────────────────────────────────────

    pub fn keyer(&self) -> &Keyer {
        &self.keyer
    }

    pub fn start_practice(&self) -> u64 {
        self.keyer.start_session(KeyerMode::Practice)
    }

    pub fn start_challenge(&self, planned_total: u32) -> u64 {
        self.keyer.start_session(KeyerMode::Challenge {
            lives: self.config.challenge_lives,
            planned_total,
        })
    }

    pub fn begin_attempt(&self, expected: Pattern) -> Result<u32> {
        self.keyer.begin_attempt(expected)
    }

    pub fn press_start(&self, ts_ms: Option<f64>) {
        self.keyer.press_start(ts_ms);
    }

    pub fn press_end(&self, ts_ms: Option<f64>) -> Result<()> {
        self.keyer.press_end(ts_ms)
    }

    pub fn end_session(&self) -> Option<ScoreSummary> {
        self.keyer.end_session()
    }

    pub fn keyer_session(&self) -> Option<KeyerSessionState> {
        self.keyer.session()
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn subscribe_symbols(&self) -> broadcast::Receiver<SymbolEvent> {
        self.symbol_tx.subscribe()
    }

    pub fn subscribe_verdicts(&self) -> broadcast::Receiver<VerdictEvent> {
        self.keyer.subscribe_verdicts()
    }

    pub fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackStatusEvent> {
        self.scheduler.subscribe_status()
    }

    // ── Diagnostics & audio lifecycle ────────────────────────────────────────

    pub fn diagnostics(&self) -> &Arc<LatencyStore> {
        &self.diagnostics
    }

    pub fn channel_snapshot(&self, channel: OutputChannel) -> ChannelSnapshot {
        self.diagnostics.snapshot(channel)
    }

    pub fn diagnostics_snapshot(&self) -> Vec<ChannelSnapshot> {
        self.diagnostics.snapshot_all()
    }

    pub fn timing_anomalies(&self) -> Vec<TimingAnomaly> {
        self.diagnostics.anomalies()
    }

    /// # Errors
    /// IO or serialization failure writing the bundle.
    pub fn export_diagnostics(&self, path: &Path) -> Result<()> {
        self.diagnostics.export_json(path)
    }

    pub fn reset_diagnostics(&self) {
        self.diagnostics.reset();
    }

    pub fn audio_state(&self) -> ChannelState {
        self.tone.lock().state()
    }

    /// `true` once a backend failure has been recorded since the last rebuild.
    pub fn audio_needs_rebuild(&self) -> bool {
        self.tone.lock().needs_reevaluation()
    }

    /// Stop playback, tear the tone backend down, and walk the chain again.
    pub fn rebuild_audio(&self) -> ChannelState {
        self.scheduler.stop();
        let state = self.tone.lock().rebuild();
        info!(?state, "tone output rebuilt");
        state
    }

    /// Cancel everything and release the tone backend. Idempotent.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.keyer.reset();
        self.tone.lock().teardown();
        info!("engine shut down");
    }
}

impl std::fmt::Debug for CadenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceEngine")
            .field("config", &self.config)
            .field("audio", &self.audio_state())
            .field("keyer", &self.keyer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_values_parse() {
        assert_eq!(parse_switch("1"), Some(true));
        assert_eq!(parse_switch(" ON "), Some(true));
        assert_eq!(parse_switch("false"), Some(false));
        assert_eq!(parse_switch("off"), Some(false));
        assert_eq!(parse_switch("maybe"), None);
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.low_latency_frames, 128);
        assert_eq!(config.diagnostics_capacity, 200);
        assert_eq!(config.challenge_lives, 3);
        assert!(config.scheduler.poll_interval_ms >= 1);
        assert!(!config.device_tag.is_empty());
    }
}
