//! Playback scheduler.
//!
//! Drives the tone output through a pattern's tone/silence segments and
//! raises one symbol-start callback per symbol.
//!
//! ## Dispatch paths
//!
//! ```text
//! backend sequences?  ──yes──► reconcile reports (Scheduled / Actual)
//!        │
//!        no
//!        ▼
//! timer path: start ─► callback ─► sleep to tone end ─► stop ─► sleep to gap end
//! ```
//!
//! Both paths compute every deadline from the pattern's start instant, so
//! per-symbol error never accumulates.
//!
//! ## Reconciliation
//!
//! A `Scheduled` report arms an entry that fires `lead_ms` ahead of the
//! backend's expected start (never before the report arrives). The matching
//! `Actual` report then only back-fills backend timing into the context
//! already handed out, and notifies the back-fill hook if one is set. An `Actual` report for an entry
//! that has not fired yet (or was never announced) dispatches once, with
//! phase `Actual`. Symbols the backend never confirms are synthesized from
//! the schedule once the deadline (plan length + slack) passes.
//!
//! ## Cancellation
//!
//! Each playback call advances the generation; `stop()` does too. Every
//! wait re-checks its token and returns `PlaybackOutcome::Cancelled` once
//! stale. Whoever advances the generation is responsible for silencing the
//! tone, so a stale playback never touches the output again.

pub mod context;
pub mod generation;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::clock::SharedClock;
use crate::diagnostics::{LatencySample, LatencyStore, TimingAnomaly};
use crate::error::{CadenceError, Result};
use crate::ipc::events::{PlaybackStatus, PlaybackStatusEvent};
use crate::output::OutputChannel;
use crate::settings::SettingsSnapshot;
use crate::timing::{text_to_patterns, MorseGap, MorseSymbol, Pattern, TextElement, TimingModel};
use crate::tone::{BackendReport, ChannelState, PlannedSymbol, TonePlan, ToneOutput};

pub use context::{
    CorrelationIds, DispatchPhase, EntryState, PlaybackCorrelation, ScheduledEntry,
    SharedSymbolContext, SymbolContext,
};
pub use generation::Generation;

/// How far ahead of a symbol's expected start the scheduled path fires.
pub const DEFAULT_LEAD_MS: f64 = 64.0;

/// Poll cadence for backend reports.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 4;

/// Backend offset beyond which a symbol is logged as a timing anomaly.
pub const DEFAULT_ANOMALY_THRESHOLD_MS: f64 = 80.0;

/// Grace period past the plan's end before unconfirmed symbols are
/// synthesized.
pub const DEFAULT_DEADLINE_SLACK_MS: f64 = 500.0;

/// Source tag for symbols driven by the scheduler's own timers.
pub const TIMER_SOURCE: &str = "timer";

const STATUS_CAP: usize = 64;

/// Observer for timing back-filled into an already dispatched symbol.
pub type BackfillHook = Arc<dyn Fn(MorseSymbol, f64, &SymbolContext) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub lead_ms: f64,
    pub poll_interval_ms: u64,
    pub anomaly_threshold_ms: f64,
    pub deadline_slack_ms: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lead_ms: DEFAULT_LEAD_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            anomaly_threshold_ms: DEFAULT_ANOMALY_THRESHOLD_MS,
            deadline_slack_ms: DEFAULT_DEADLINE_SLACK_MS,
        }
    }
}

/// Audio-side settings the scheduler applies to every playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioOptions {
    pub enabled: bool,
    pub hz: f32,
    pub gain: f32,
}

impl From<&SettingsSnapshot> for AudioOptions {
    fn from(settings: &SettingsSnapshot) -> Self {
        Self {
            enabled: settings.audio_enabled,
            hz: settings.tone_hz,
            gain: settings.audio_gain(),
        }
    }
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self::from(&SettingsSnapshot::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
}

fn after_ms(base: Instant, ms: f64) -> Instant {
    base + Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
}

/// Timing anchor and identity shared by every symbol of one pattern.
struct PatternRun<'a> {
    token: u64,
    correlation: &'a PlaybackCorrelation,
    plan: TonePlan,
    t0: Instant,
    t0_ms: f64,
    first_index: usize,
}

impl PatternRun<'_> {
    fn requested_at(&self, planned: &PlannedSymbol) -> f64 {
        self.t0_ms + planned.offset_ms
    }

    fn end(&self) -> Instant {
        after_ms(self.t0, self.plan.total_ms())
    }
}

pub struct PlaybackScheduler {
    config: SchedulerConfig,
    clock: SharedClock,
    diagnostics: Arc<LatencyStore>,
    output: Arc<Mutex<ToneOutput>>,
    audio: RwLock<AudioOptions>,
    generation: Generation,
    correlations: CorrelationIds,
    status_tx: broadcast::Sender<PlaybackStatusEvent>,
    backfill: RwLock<Option<BackfillHook>>,
}

impl PlaybackScheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: SharedClock,
        diagnostics: Arc<LatencyStore>,
        output: Arc<Mutex<ToneOutput>>,
        audio: AudioOptions,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CAP);
        Self {
            config,
            clock,
            diagnostics,
            output,
            audio: RwLock::new(audio),
            generation: Generation::new(),
            correlations: CorrelationIds::new(),
            status_tx,
            backfill: RwLock::new(None),
        }
    }

    /// Called once per symbol whose `Actual` report lands after its
    /// `Scheduled` dispatch, with the back-filled context.
    pub fn set_backfill_hook(&self, hook: impl Fn(MorseSymbol, f64, &SymbolContext) + Send + Sync + 'static) {
        *self.backfill.write() = Some(Arc::new(hook));
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<PlaybackStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn audio_options(&self) -> AudioOptions {
        *self.audio.read()
    }

    /// Apply new audio settings. Volume reaches a live controller at once;
    /// frequency applies from the next pattern.
    pub fn update_audio(&self, settings: &SettingsSnapshot) {
        let audio = AudioOptions::from(settings);
        *self.audio.write() = audio;
        let mut output = self.output.lock();
        output.set_probe_params(audio.hz, audio.gain);
        if output.state() != ChannelState::Unavailable {
            let _ = output.set_volume(audio.gain);
        }
    }

    /// Cancel the current playback, if any, and silence the tone.
    pub fn stop(&self) {
        let token = self.generation.advance();
        self.silence();
        debug!(generation = token, "playback stopped");
    }

    /// Play one pattern. Returns once its last tone has ended.
    ///
    /// # Errors
    /// `ChannelUnavailable` when audio is enabled but no tone backend exists.
    pub async fn play_morse<F>(&self, pattern: &Pattern, unit_ms: f64, mut on_symbol: F) -> Result<PlaybackOutcome>
    where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext) + Send,
    {
        let (token, correlation) = self.begin("morse")?;
        let span = info_span!("playback", generation = token, correlation = correlation.id.as_str());
        let result = async {
            let mut index = 0;
            self.run_pattern(token, &correlation, pattern, unit_ms, Instant::now(), &mut index, &mut on_symbol)
                .await
        }
        .instrument(span)
        .await;
        self.finish(token, &correlation, result.map(|end| end.is_some()))
    }

    /// Silence of a 1, 3 or 7 unit gap.
    pub async fn play_gap(&self, gap: MorseGap, unit_ms: f64) -> PlaybackOutcome {
        let token = self.generation.advance();
        let gap_ms = TimingModel::from_unit_ms(unit_ms).gap_ms(gap);
        if self
            .generation
            .sleep_until(token, after_ms(Instant::now(), gap_ms))
            .await
        {
            PlaybackOutcome::Completed
        } else {
            PlaybackOutcome::Cancelled
        }
    }

    /// Play text: characters separated by inter gaps, words by word gaps.
    /// Unmapped characters are skipped. One correlation covers the whole
    /// text and symbol indexes run across it.
    pub async fn play_text<F>(&self, text: &str, unit_ms: f64, mut on_symbol: F) -> Result<PlaybackOutcome>
    where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext) + Send,
    {
        let (token, correlation) = self.begin("text")?;
        let span = info_span!("playback", generation = token, correlation = correlation.id.as_str());
        let timing = TimingModel::from_unit_ms(unit_ms);
        let result = async {
            let mut at = Instant::now();
            let mut index = 0;
            let mut pending_gap: Option<MorseGap> = None;
            for element in text_to_patterns(text) {
                match element {
                    TextElement::WordBreak => {
                        if index > 0 {
                            pending_gap = Some(MorseGap::Word);
                        }
                    }
                    TextElement::Char(c, pattern) => {
                        if let Some(gap) = pending_gap.take() {
                            at = after_ms(at, timing.gap_ms(gap));
                        }
                        debug!(character = %c, "playing character");
                        match self
                            .run_pattern(token, &correlation, &pattern, unit_ms, at, &mut index, &mut on_symbol)
                            .await?
                        {
                            Some(end) => at = end,
                            None => return Ok(false),
                        }
                        pending_gap = Some(MorseGap::Inter);
                    }
                }
            }
            Ok::<bool, CadenceError>(true)
        }
        .instrument(span)
        .await;
        self.finish(token, &correlation, result)
    }

    fn begin(&self, source: &str) -> Result<(u64, PlaybackCorrelation)> {
        let token = self.generation.advance();
        self.silence();
        let correlation = self.correlations.issue(source, self.clock.now_ms());
        if self.audio_options().enabled && self.output.lock().state() == ChannelState::Unavailable {
            self.emit(PlaybackStatus::Unavailable, Some(&correlation), token);
            return Err(CadenceError::ChannelUnavailable(OutputChannel::Audio));
        }
        self.emit(PlaybackStatus::Playing, Some(&correlation), token);
        Ok((token, correlation))
    }

    fn finish(&self, token: u64, correlation: &PlaybackCorrelation, result: Result<bool>) -> Result<PlaybackOutcome> {
        let completed = result?;
        let outcome = if completed && self.generation.is_current(token) {
            PlaybackOutcome::Completed
        } else {
            PlaybackOutcome::Cancelled
        };
        let status = match outcome {
            PlaybackOutcome::Completed => PlaybackStatus::Completed,
            PlaybackOutcome::Cancelled => PlaybackStatus::Cancelled,
        };
        self.emit(status, Some(correlation), token);
        Ok(outcome)
    }

    fn emit(&self, status: PlaybackStatus, correlation: Option<&PlaybackCorrelation>, generation: u64) {
        let _ = self.status_tx.send(PlaybackStatusEvent {
            status,
            correlation_id: correlation.map(|c| c.id.clone()),
            generation,
            at_ms: self.clock.now_ms(),
        });
    }

    fn silence(&self) {
        let mut output = self.output.lock();
        if output.state() != ChannelState::Unavailable {
            let _ = output.cancel_sequence();
        }
    }

    /// Run `f` on the output only while `token` is current. The check and
    /// the call happen under the output lock, so a concurrent `stop()`
    /// either silences after us or makes us skip.
    fn with_output<R>(&self, token: u64, f: impl FnOnce(&mut ToneOutput) -> Result<R>) -> Result<Option<R>> {
        let mut output = self.output.lock();
        if !self.generation.is_current(token) {
            return Ok(None);
        }
        f(&mut output).map(Some)
    }

    /// Returns the planned end instant, or `None` if cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn run_pattern<F>(
        &self,
        token: u64,
        correlation: &PlaybackCorrelation,
        pattern: &Pattern,
        unit_ms: f64,
        start_at: Instant,
        index: &mut usize,
        on_symbol: &mut F,
    ) -> Result<Option<Instant>>
    where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext) + Send,
    {
        if pattern.is_empty() {
            return Ok(Some(start_at));
        }
        if !self.generation.sleep_until(token, start_at).await {
            return Ok(None);
        }

        let audio = self.audio_options();
        // Timers stay anchored to the requested start even if we woke late.
        let lag_ms = Instant::now().saturating_duration_since(start_at).as_secs_f64() * 1000.0;
        let mut run = PatternRun {
            token,
            correlation,
            plan: TonePlan::from_pattern(pattern, unit_ms, audio.hz, self.config.lead_ms),
            t0: start_at,
            t0_ms: self.clock.now_ms() - lag_ms,
            first_index: *index,
        };

        let sequenced = if audio.enabled {
            let plan = &run.plan;
            let sequenced = self.with_output(token, |o| Ok((o.sequence(plan)?, o.backend_kind())))?;
            match sequenced {
                Some((reports, backend)) => reports.map(|rx| (rx, backend)),
                None => return Ok(None),
            }
        } else {
            None
        };
        let end = match sequenced {
            Some((reports, backend)) => {
                // The backend starts on its next callback; anchor there.
                run.t0 = Instant::now();
                run.t0_ms = self.clock.now_ms();
                let source = backend.map_or("native", |b| b.as_str());
                self.run_sequenced(&run, reports, source, on_symbol).await?
            }
            None => self.run_timed(&run, audio, on_symbol).await?,
        };
        *index += run.plan.len();
        Ok(end)
    }

    async fn run_timed<F>(&self, run: &PatternRun<'_>, audio: AudioOptions, on_symbol: &mut F) -> Result<Option<Instant>>
    where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext) + Send,
    {
        for planned in &run.plan.symbols {
            if !self
                .generation
                .sleep_until(run.token, after_ms(run.t0, planned.offset_ms))
                .await
            {
                return Ok(None);
            }
            let requested_at = run.requested_at(planned);
            if audio.enabled {
                if self
                    .with_output(run.token, |o| o.start(Some(audio.hz)))?
                    .is_none()
                {
                    return Ok(None);
                }
                self.diagnostics.record_since(
                    OutputChannel::Audio,
                    requested_at,
                    Some(TIMER_SOURCE),
                    Some(run.correlation.id.as_str()),
                );
            }

            let ctx = SharedSymbolContext::new(SymbolContext::new(
                run.correlation.id.as_str(),
                TIMER_SOURCE,
                run.token,
                run.first_index + planned.sequence as usize,
                requested_at,
                DispatchPhase::Actual,
            ));
            on_symbol(planned.symbol, planned.duration_ms, &ctx);

            if !self
                .generation
                .sleep_until(run.token, after_ms(run.t0, planned.end_ms()))
                .await
            {
                return Ok(None);
            }
            if audio.enabled && self.with_output(run.token, |o| o.stop())?.is_none() {
                return Ok(None);
            }
        }
        Ok(Some(run.end()))
    }

    async fn run_sequenced<F>(
        &self,
        run: &PatternRun<'_>,
        reports: Receiver<BackendReport>,
        source: &'static str,
        on_symbol: &mut F,
    ) -> Result<Option<Instant>>
    where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext) + Send,
    {
        let mut entries: BTreeMap<u32, ScheduledEntry> = BTreeMap::new();
        let total = run.plan.len();
        let deadline_ms = run.t0_ms + run.plan.total_ms() + self.config.deadline_slack_ms;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            let mut disconnected = false;
            loop {
                match reports.try_recv() {
                    Ok(report) => self.reconcile(run, &mut entries, report, source, on_symbol),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }

            let now_ms = self.clock.now_ms();
            for entry in entries.values_mut() {
                if entry.state == EntryState::Pending && entry.fire_at_ms <= now_ms {
                    let Some(planned) = run.plan.get(entry.sequence) else {
                        continue;
                    };
                    let ctx = self.dispatch(run, planned, source, DispatchPhase::Scheduled, on_symbol);
                    entry.context = Some(ctx);
                    entry.state = EntryState::Dispatched;
                }
            }

            let actualized = entries
                .values()
                .filter(|e| e.state == EntryState::Actualized)
                .count();
            if actualized == total {
                break;
            }
            if disconnected || now_ms >= deadline_ms {
                self.synthesize_missing(run, &mut entries, source, on_symbol);
                break;
            }
            if !self
                .generation
                .sleep_until(run.token, Instant::now() + poll)
                .await
            {
                return Ok(None);
            }
        }

        if !self.generation.sleep_until(run.token, run.end()).await {
            return Ok(None);
        }
        Ok(Some(run.end()))
    }

    fn reconcile<F>(
        &self,
        run: &PatternRun<'_>,
        entries: &mut BTreeMap<u32, ScheduledEntry>,
        report: BackendReport,
        source: &'static str,
        on_symbol: &mut F,
    ) where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext),
    {
        let Some(planned) = run.plan.get(report.sequence) else {
            debug!(sequence = report.sequence, "report for unknown sequence");
            return;
        };

        match report.phase {
            DispatchPhase::Scheduled => {
                let fire_at_ms = (report.timestamp_ms - self.config.lead_ms).max(self.clock.now_ms());
                entries.entry(report.sequence).or_insert_with(|| {
                    ScheduledEntry::pending(planned.sequence, planned.symbol, planned.duration_ms, fire_at_ms)
                });
            }
            DispatchPhase::Actual => {
                let entry = entries.entry(report.sequence).or_insert_with(|| {
                    ScheduledEntry::pending(
                        planned.sequence,
                        planned.symbol,
                        planned.duration_ms,
                        report.timestamp_ms,
                    )
                });
                let ctx = match entry.state {
                    EntryState::Actualized => return,
                    EntryState::Dispatched => match entry.context.clone() {
                        Some(ctx) => ctx,
                        None => return,
                    },
                    EntryState::Pending => {
                        let ctx = SharedSymbolContext::new(self.context_for(run, planned, source, DispatchPhase::Actual));
                        ctx.update(|c| self.apply_report(c, &report, planned));
                        on_symbol(planned.symbol, planned.duration_ms, &ctx);
                        entry.context = Some(ctx.clone());
                        entry.state = EntryState::Actualized;
                        self.record_backend_timing(&ctx.snapshot(), planned);
                        return;
                    }
                };
                let snapshot = ctx.update(|c| {
                    self.apply_report(c, &report, planned);
                    c.clone()
                });
                entry.state = EntryState::Actualized;
                self.record_backend_timing(&snapshot, planned);
                let hook = self.backfill.read().clone();
                if let Some(hook) = hook {
                    hook(planned.symbol, planned.duration_ms, &snapshot);
                }
            }
        }
    }

    fn apply_report(&self, ctx: &mut SymbolContext, report: &BackendReport, planned: &PlannedSymbol) {
        ctx.sequence = Some(report.sequence);
        ctx.apply_backend_timing(
            report.timestamp_ms,
            report.duration_ms,
            planned.duration_ms,
            self.config.anomaly_threshold_ms,
        );
    }

    fn synthesize_missing<F>(
        &self,
        run: &PatternRun<'_>,
        entries: &mut BTreeMap<u32, ScheduledEntry>,
        source: &'static str,
        on_symbol: &mut F,
    ) where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext),
    {
        for planned in &run.plan.symbols {
            let pending = entries
                .get(&planned.sequence)
                .map_or(true, |e| e.state == EntryState::Pending);
            if !pending {
                continue;
            }
            debug!(sequence = planned.sequence, "backend never confirmed symbol; synthesizing");
            let ctx = self.dispatch(run, planned, source, DispatchPhase::Actual, on_symbol);
            let mut entry = ScheduledEntry::pending(
                planned.sequence,
                planned.symbol,
                planned.duration_ms,
                run.requested_at(planned),
            );
            entry.context = Some(ctx);
            entry.state = EntryState::Actualized;
            entries.insert(planned.sequence, entry);
        }
    }

    fn context_for(&self, run: &PatternRun<'_>, planned: &PlannedSymbol, source: &str, phase: DispatchPhase) -> SymbolContext {
        let mut ctx = SymbolContext::new(
            run.correlation.id.as_str(),
            source,
            run.token,
            run.first_index + planned.sequence as usize,
            run.requested_at(planned),
            phase,
        );
        ctx.sequence = Some(planned.sequence);
        ctx
    }

    fn dispatch<F>(
        &self,
        run: &PatternRun<'_>,
        planned: &PlannedSymbol,
        source: &str,
        phase: DispatchPhase,
        on_symbol: &mut F,
    ) -> SharedSymbolContext
    where
        F: FnMut(MorseSymbol, f64, &SharedSymbolContext),
    {
        let ctx = SharedSymbolContext::new(self.context_for(run, planned, source, phase));
        on_symbol(planned.symbol, planned.duration_ms, &ctx);
        ctx
    }

    fn record_backend_timing(&self, ctx: &SymbolContext, planned: &PlannedSymbol) {
        let Some(backend_ts) = ctx.backend_timestamp_ms else {
            return;
        };
        let now = self.clock.now_ms();
        self.diagnostics.push(
            OutputChannel::Audio,
            LatencySample {
                latency_ms: (backend_ts - ctx.requested_at_ms).max(0.0),
                captured_at_ms: now,
                requested_at_ms: Some(ctx.requested_at_ms),
                source: Some(ctx.source.clone()),
                correlation_id: Some(ctx.correlation_id.clone()),
                device_tag: self.diagnostics.device_tag().to_owned(),
            },
        );
        if ctx.anomaly {
            self.diagnostics.record_anomaly(TimingAnomaly {
                correlation_id: ctx.correlation_id.clone(),
                sequence: Some(planned.sequence),
                offset_ms: ctx.offset_ms.unwrap_or_default(),
                skew_ms: ctx.skew_ms,
                captured_at_ms: now,
            });
        }
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("config", &self.config)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use approx::assert_relative_eq;
    use crate::tone::{BackendChain, BackendKind, BackendProbe, ProbeContext, ToneController, VirtualProbe};

    fn probe_ctx(clock: SharedClock) -> ProbeContext {
        ProbeContext {
            clock,
            hz: 600.0,
            gain: 0.8,
            low_latency_override: None,
            low_latency_frames: 128,
        }
    }

    fn scheduler_with(chain: BackendChain, audio_enabled: bool) -> (Arc<PlaybackScheduler>, Arc<LatencyStore>) {
        let clock = TokioClock::shared();
        let diagnostics = Arc::new(LatencyStore::new(clock.clone(), "test"));
        let output = ToneOutput::new(Arc::new(chain), probe_ctx(clock.clone()), diagnostics.clone());
        let scheduler = PlaybackScheduler::new(
            SchedulerConfig::default(),
            clock,
            diagnostics.clone(),
            Arc::new(Mutex::new(output)),
            AudioOptions {
                enabled: audio_enabled,
                hz: 600.0,
                gain: 0.8,
            },
        );
        (Arc::new(scheduler), diagnostics)
    }

    type Calls = Arc<Mutex<Vec<(MorseSymbol, f64, SymbolContext)>>>;

    fn assert_elapsed(started: Instant, expected_ms: u64) {
        let elapsed = Instant::now() - started;
        assert!(
            elapsed >= Duration::from_millis(expected_ms)
                && elapsed < Duration::from_millis(expected_ms + 5),
            "elapsed {elapsed:?}, expected {expected_ms} ms"
        );
    }

    fn recorder(calls: &Calls) -> impl FnMut(MorseSymbol, f64, &SharedSymbolContext) + Send + 'static {
        let calls = calls.clone();
        move |symbol, duration, ctx| calls.lock().push((symbol, duration, ctx.snapshot()))
    }

    #[tokio::test(start_paused = true)]
    async fn timer_path_fires_each_symbol_at_its_offset() {
        let (scheduler, diagnostics) = scheduler_with(BackendChain::virtual_only(), true);
        let calls: Calls = Arc::default();
        let k = Pattern::parse("-.-").unwrap();
        let started = Instant::now();
        let outcome = scheduler
            .play_morse(&k, 100.0, recorder(&calls))
            .await
            .expect("play");
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_elapsed(started, 900);

        let calls = calls.lock();
        let got: Vec<(MorseSymbol, f64)> = calls.iter().map(|(s, d, _)| (*s, *d)).collect();
        assert_eq!(
            got,
            vec![
                (MorseSymbol::Dash, 300.0),
                (MorseSymbol::Dot, 100.0),
                (MorseSymbol::Dash, 300.0)
            ]
        );
        let first_requested = calls[0].2.requested_at_ms;
        for ((_, _, c), expected) in calls.iter().zip([0.0, 400.0, 600.0]) {
            assert_relative_eq!(c.requested_at_ms - first_requested, expected, epsilon = 1e-6);
        }
        assert!(calls.iter().all(|(_, _, c)| c.source == TIMER_SOURCE
            && c.phase == DispatchPhase::Actual
            && c.correlation_id == calls[0].2.correlation_id));
        assert_eq!(diagnostics.snapshot(OutputChannel::Audio).count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_disabled_still_dispatches_without_tone() {
        let (scheduler, diagnostics) = scheduler_with(BackendChain::new(Vec::new()), false);
        let calls: Calls = Arc::default();
        let outcome = scheduler
            .play_morse(&Pattern::parse("..").unwrap(), 50.0, recorder(&calls))
            .await
            .expect("play");
        assert_eq!(outcome, PlaybackOutcome::Completed);
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(diagnostics.snapshot(OutputChannel::Audio).count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_audio_is_the_only_error() {
        let (scheduler, _) = scheduler_with(BackendChain::new(Vec::new()), true);
        let mut status = scheduler.subscribe_status();
        let err = scheduler
            .play_morse(&Pattern::parse(".").unwrap(), 50.0, |_, _, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CadenceError::ChannelUnavailable(OutputChannel::Audio)));
        assert_eq!(status.recv().await.unwrap().status, PlaybackStatus::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_pattern_stops_callbacks() {
        let (scheduler, _) = scheduler_with(BackendChain::virtual_only(), true);
        let calls: Calls = Arc::default();
        let task = {
            let scheduler = scheduler.clone();
            let on_symbol = recorder(&calls);
            tokio::spawn(async move {
                scheduler
                    .play_morse(&Pattern::parse("-----").unwrap(), 100.0, on_symbol)
                    .await
            })
        };
        // Second dash starts at 400 ms; stop during it.
        tokio::time::sleep(Duration::from_millis(450)).await;
        scheduler.stop();
        let outcome = task.await.expect("join").expect("play");
        assert_eq!(outcome, PlaybackOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_durations_follow_unit() {
        let (scheduler, _) = scheduler_with(BackendChain::virtual_only(), true);
        for (gap, ms) in [(MorseGap::Intra, 100), (MorseGap::Inter, 300), (MorseGap::Word, 700)] {
            let started = Instant::now();
            assert_eq!(scheduler.play_gap(gap, 100.0).await, PlaybackOutcome::Completed);
            assert_elapsed(started, ms);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn text_inserts_inter_and_word_gaps() {
        let (scheduler, _) = scheduler_with(BackendChain::virtual_only(), true);
        let calls: Calls = Arc::default();
        let started = Instant::now();
        let outcome = scheduler
            .play_text("e e", 100.0, recorder(&calls))
            .await
            .expect("play");
        assert_eq!(outcome, PlaybackOutcome::Completed);
        // dot, 7-unit word gap, dot
        assert_elapsed(started, 900);
        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].2.index, 1);
        assert_relative_eq!(
            calls[1].2.requested_at_ms - calls[0].2.requested_at_ms,
            800.0,
            epsilon = 1e-6
        );
    }

    #[tokio::test(start_paused = true)]
    async fn playback_emits_playing_then_completed() {
        let (scheduler, _) = scheduler_with(BackendChain::virtual_only(), true);
        let mut status = scheduler.subscribe_status();
        scheduler
            .play_morse(&Pattern::parse(".").unwrap(), 20.0, |_, _, _| {})
            .await
            .expect("play");
        assert_eq!(status.recv().await.unwrap().status, PlaybackStatus::Playing);
        assert_eq!(status.recv().await.unwrap().status, PlaybackStatus::Completed);
    }

    /// Sequencing backend double: reports each symbol from a tokio task,
    /// `Scheduled` at `lead` before start and `Actual` `confirm_delay_ms`
    /// after it. Sequences listed in `silent` are never reported at all.
    struct ScriptedSequencer {
        clock: SharedClock,
        announce: bool,
        confirm_delay_ms: f64,
        silent: Vec<u32>,
    }

    impl ToneController for ScriptedSequencer {
        fn kind(&self) -> BackendKind {
            BackendKind::Stream
        }
        fn prepare(&mut self, _hz: f32) -> Result<()> {
            Ok(())
        }
        fn start(&mut self, _hz: Option<f32>) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn teardown(&mut self) {}
        fn current_hz(&self) -> Option<f32> {
            None
        }
        fn sequence(&mut self, plan: &TonePlan) -> Result<Option<Receiver<BackendReport>>> {
            let (tx, rx) = crossbeam_channel::unbounded();
            let t0 = Instant::now();
            let t0_ms = self.clock.now_ms();
            let plan = plan.clone();
            let announce = self.announce;
            let delay = self.confirm_delay_ms;
            let silent = self.silent.clone();
            tokio::spawn(async move {
                let mut events: Vec<(f64, BackendReport)> = Vec::new();
                for s in plan.symbols.iter().filter(|s| !silent.contains(&s.sequence)) {
                    if announce {
                        events.push((
                            (s.offset_ms - plan.lead_ms).max(0.0),
                            BackendReport {
                                sequence: s.sequence,
                                phase: DispatchPhase::Scheduled,
                                timestamp_ms: t0_ms + s.offset_ms,
                                duration_ms: None,
                            },
                        ));
                    }
                    events.push((
                        s.offset_ms + delay,
                        BackendReport {
                            sequence: s.sequence,
                            phase: DispatchPhase::Actual,
                            timestamp_ms: t0_ms + s.offset_ms + delay,
                            duration_ms: Some(s.duration_ms),
                        },
                    ));
                }
                events.sort_by(|a, b| a.0.total_cmp(&b.0));
                for (at, report) in events {
                    tokio::time::sleep_until(after_ms(t0, at)).await;
                    if tx.send(report).is_err() {
                        return;
                    }
                }
                // Keep the channel open like a live stream would.
                tokio::time::sleep(Duration::from_secs(5)).await;
            });
            Ok(Some(rx))
        }
    }

    struct SequencerProbe {
        announce: bool,
        confirm_delay_ms: f64,
        silent: Vec<u32>,
    }

    impl BackendProbe for SequencerProbe {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn probe(&self, ctx: &ProbeContext) -> Option<Box<dyn ToneController>> {
            Some(Box::new(ScriptedSequencer {
                clock: ctx.clock.clone(),
                announce: self.announce,
                confirm_delay_ms: self.confirm_delay_ms,
                silent: self.silent.clone(),
            }))
        }
    }

    fn sequencer(announce: bool, confirm_delay_ms: f64, silent: Vec<u32>) -> BackendChain {
        BackendChain::new(vec![
            Box::new(SequencerProbe {
                announce,
                confirm_delay_ms,
                silent,
            }),
            Box::new(VirtualProbe),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_then_actual_dispatches_exactly_once() {
        let (scheduler, diagnostics) = scheduler_with(sequencer(true, 10.0, Vec::new()), true);
        let calls: Calls = Arc::default();
        let handles: Arc<Mutex<Vec<SharedSymbolContext>>> = Arc::default();
        let on_symbol = {
            let calls = calls.clone();
            let handles = handles.clone();
            move |symbol: MorseSymbol, duration: f64, ctx: &SharedSymbolContext| {
                calls.lock().push((symbol, duration, ctx.snapshot()));
                handles.lock().push(ctx.clone());
            }
        };
        let outcome = scheduler
            .play_morse(&Pattern::parse("-.-").unwrap(), 100.0, on_symbol)
            .await
            .expect("play");
        assert_eq!(outcome, PlaybackOutcome::Completed);

        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, _, c)| c.phase == DispatchPhase::Scheduled));
        assert!(calls.iter().all(|(_, _, c)| c.source == "stream"));

        // Actual confirmations were back-filled into the delivered contexts.
        for handle in handles.lock().iter() {
            let ctx = handle.snapshot();
            let offset = ctx.offset_ms.expect("backfilled offset");
            assert!((offset - 10.0).abs() < 5.0, "offset {offset}");
            assert_eq!(ctx.skew_ms, Some(0.0));
            assert!(!ctx.anomaly);
        }
        assert_eq!(diagnostics.snapshot(OutputChannel::Audio).count, 3);
        assert!(diagnostics.anomalies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_path_fires_lead_ahead_of_planned_start() {
        let (scheduler, _) = scheduler_with(sequencer(true, 10.0, Vec::new()), true);
        let fired: Arc<Mutex<Vec<(f64, f64)>>> = Arc::default();
        let started = Instant::now();
        let on_symbol = {
            let fired = fired.clone();
            move |_: MorseSymbol, _: f64, ctx: &SharedSymbolContext| {
                let at = (Instant::now() - started).as_secs_f64() * 1000.0;
                fired.lock().push((at, ctx.snapshot().requested_at_ms));
            }
        };
        scheduler
            .play_morse(&Pattern::parse("-.-").unwrap(), 100.0, on_symbol)
            .await
            .expect("play");

        let fired = fired.lock();
        assert_eq!(fired.len(), 3);
        let t0 = fired[0].1;
        for (at, requested) in fired.iter().skip(1) {
            let planned = requested - t0;
            let expected = planned - DEFAULT_LEAD_MS;
            assert!(
                *at >= expected - 0.5 && *at <= expected + 5.0,
                "fired at {at} ms for planned start {planned} ms"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_hook_sees_timing_for_dispatched_symbols() {
        let (scheduler, _) = scheduler_with(sequencer(true, 10.0, Vec::new()), true);
        let backfilled: Arc<Mutex<Vec<(MorseSymbol, SymbolContext)>>> = Arc::default();
        {
            let backfilled = backfilled.clone();
            scheduler.set_backfill_hook(move |symbol, _, ctx| backfilled.lock().push((symbol, ctx.clone())));
        }
        scheduler
            .play_morse(&Pattern::parse("-.").unwrap(), 100.0, |_, _, _| {})
            .await
            .expect("play");

        let backfilled = backfilled.lock();
        let symbols: Vec<MorseSymbol> = backfilled.iter().map(|(s, _)| *s).collect();
        assert_eq!(symbols, vec![MorseSymbol::Dash, MorseSymbol::Dot]);
        for (_, ctx) in backfilled.iter() {
            assert_eq!(ctx.phase, DispatchPhase::Scheduled);
            let offset = ctx.offset_ms.expect("offset");
            assert!((offset - 10.0).abs() < 5.0, "offset {offset}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_hook_is_silent_on_direct_actual_dispatch() {
        let (scheduler, _) = scheduler_with(sequencer(false, 5.0, Vec::new()), true);
        let hits = Arc::new(Mutex::new(0usize));
        {
            let hits = hits.clone();
            scheduler.set_backfill_hook(move |_, _, _| *hits.lock() += 1);
        }
        scheduler
            .play_morse(&Pattern::parse("..").unwrap(), 100.0, |_, _, _| {})
            .await
            .expect("play");
        assert_eq!(*hits.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn actual_without_announcement_dispatches_once_as_actual() {
        let (scheduler, _) = scheduler_with(sequencer(false, 5.0, Vec::new()), true);
        let calls: Calls = Arc::default();
        scheduler
            .play_morse(&Pattern::parse("..").unwrap(), 100.0, recorder(&calls))
            .await
            .expect("play");
        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, _, c)| c.phase == DispatchPhase::Actual));
        assert!(calls.iter().all(|(_, _, c)| c.backend_timestamp_ms.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn late_confirmation_is_recorded_as_anomaly() {
        let (scheduler, diagnostics) = scheduler_with(sequencer(true, 120.0, Vec::new()), true);
        scheduler
            .play_morse(&Pattern::parse(".").unwrap(), 100.0, |_, _, _| {})
            .await
            .expect("play");
        let anomalies = diagnostics.anomalies();
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].offset_ms > 80.0);
        assert_eq!(anomalies[0].sequence, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_symbols_are_synthesized_after_deadline() {
        let (scheduler, _) = scheduler_with(sequencer(false, 0.0, vec![1]), true);
        let calls: Calls = Arc::default();
        let started = Instant::now();
        scheduler
            .play_morse(&Pattern::parse("...").unwrap(), 100.0, recorder(&calls))
            .await
            .expect("play");
        assert!(Instant::now() - started >= Duration::from_millis(500 + 500));
        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        let synthesized: Vec<_> = calls
            .iter()
            .filter(|(_, _, c)| c.backend_timestamp_ms.is_none())
            .map(|(_, _, c)| c.sequence)
            .collect();
        assert_eq!(synthesized, vec![Some(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_sequenced_playback() {
        let (scheduler, _) = scheduler_with(sequencer(true, 0.0, Vec::new()), true);
        let calls: Calls = Arc::default();
        let task = {
            let scheduler = scheduler.clone();
            let on_symbol = recorder(&calls);
            tokio::spawn(async move {
                scheduler
                    .play_morse(&Pattern::parse("----").unwrap(), 100.0, on_symbol)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop();
        assert_eq!(task.await.expect("join").expect("play"), PlaybackOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.lock().len(), 1);
    }
}
