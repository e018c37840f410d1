//! Native tone backends on a cpal output stream.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms, so each `NativeTone` owns a
//! dedicated audio thread that builds the stream, reports the open result
//! through a sync oneshot, then parks until the controller is torn down.
//! The controller talks to the callback only through atomics and a bounded
//! crossbeam channel of plans.
//!
//! # Callback constraints
//!
//! The output callback must not allocate, lock or block. Plans arrive fully
//! built (`PlanCursor` is pre-sized), and timing reports leave through
//! `try_send` on a bounded channel; a full channel drops the report and the
//! scheduler synthesizes the symbol from its schedule instead.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedBufferSize};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::{CadenceError, Result};
use crate::playback::DispatchPhase;
use crate::tone::sidetone::{CursorEvent, PlanCursor, SidetoneGenerator};
use crate::tone::{BackendKind, BackendProbe, BackendReport, ProbeContext, TonePlan, ToneController};

/// Platforms whose default host exposes a low-latency output path.
pub const LOW_LATENCY_PLATFORM: bool = cfg!(any(target_os = "macos", target_os = "ios"));

/// Pending plans queued for the callback. Only the newest one matters.
const PLAN_QUEUE: usize = 4;

/// Reports buffered between the callback and the scheduler.
const REPORT_CAPACITY: usize = 256;

/// Key state shared between the controller and the audio callback.
struct KeyState {
    key_down: AtomicBool,
    hz_bits: AtomicU32,
    gain_bits: AtomicU32,
    cancel_plan: AtomicBool,
    failed: AtomicBool,
}

impl KeyState {
    fn new(hz: f32, gain: f32) -> Self {
        Self {
            key_down: AtomicBool::new(false),
            hz_bits: AtomicU32::new(hz.to_bits()),
            gain_bits: AtomicU32::new(gain.clamp(0.0, 1.0).to_bits()),
            cancel_plan: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    fn hz(&self) -> f32 {
        f32::from_bits(self.hz_bits.load(Ordering::Relaxed))
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }
}

/// A plan handed to the callback together with its report sink.
struct PlanJob {
    cursor: PlanCursor,
    reports: Sender<BackendReport>,
}

#[derive(Debug, Clone, Copy)]
enum BufferRequest {
    Default,
    Fixed(u32),
}

/// Tone controller backed by a live cpal output stream.
pub struct NativeTone {
    kind: BackendKind,
    state: Arc<KeyState>,
    plans: Sender<PlanJob>,
    sample_rate: u32,
    /// Dropping this wakes the audio thread, which then drops the stream.
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    prepared: bool,
}

impl NativeTone {
    fn open(kind: BackendKind, ctx: &ProbeContext, buffer: BufferRequest) -> Result<Self> {
        let state = Arc::new(KeyState::new(ctx.hz, ctx.gain));
        let (plan_tx, plan_rx) = bounded::<PlanJob>(PLAN_QUEUE);
        let (open_tx, open_rx) = mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_state = Arc::clone(&state);
        let clock = ctx.clock.clone();
        let thread = thread::Builder::new()
            .name(format!("cadence-{}", kind.as_str()))
            .spawn(move || {
                // The stream must be built and dropped on this thread.
                let stream = match build_stream(kind, buffer, thread_state, plan_rx, clock) {
                    Ok((stream, rate)) => {
                        let _ = open_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the controller drops its sender.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!(backend = kind.as_str(), "audio thread exiting");
            })
            .map_err(|e| CadenceError::backend(kind.as_str(), e.to_string()))?;

        match open_rx.recv() {
            Ok(Ok(sample_rate)) => {
                info!(backend = kind.as_str(), sample_rate, "tone stream open");
                Ok(Self {
                    kind,
                    state,
                    plans: plan_tx,
                    sample_rate,
                    shutdown: Some(shutdown_tx),
                    thread: Some(thread),
                    prepared: false,
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CadenceError::backend(
                    kind.as_str(),
                    "audio thread exited before reporting",
                ))
            }
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shutdown.is_none() {
            return Err(CadenceError::backend(self.kind.as_str(), "controller was torn down"));
        }
        if self.state.failed.load(Ordering::Relaxed) {
            return Err(CadenceError::backend(self.kind.as_str(), "output stream failed"));
        }
        Ok(())
    }
}

impl ToneController for NativeTone {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn prepare(&mut self, hz: f32) -> Result<()> {
        self.ensure_live()?;
        self.state.hz_bits.store(hz.to_bits(), Ordering::Relaxed);
        self.prepared = true;
        Ok(())
    }

    fn start(&mut self, hz: Option<f32>) -> Result<()> {
        self.ensure_live()?;
        if let Some(hz) = hz {
            self.state.hz_bits.store(hz.to_bits(), Ordering::Relaxed);
        }
        self.state.key_down.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.state.key_down.store(false, Ordering::Release);
        Ok(())
    }

    fn teardown(&mut self) {
        self.state.key_down.store(false, Ordering::Release);
        if self.shutdown.take().is_none() {
            return;
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(backend = self.kind.as_str(), "audio thread panicked");
            }
        }
        debug!(backend = self.kind.as_str(), "native tone torn down");
    }

    fn current_hz(&self) -> Option<f32> {
        self.prepared.then(|| self.state.hz())
    }

    fn set_volume(&mut self, gain: f32) -> Result<()> {
        self.ensure_live()?;
        self.state
            .gain_bits
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn sequence(&mut self, plan: &TonePlan) -> Result<Option<Receiver<BackendReport>>> {
        self.ensure_live()?;
        let (tx, rx) = bounded(REPORT_CAPACITY);
        self.state.hz_bits.store(plan.hz.to_bits(), Ordering::Relaxed);
        self.state.cancel_plan.store(false, Ordering::Release);
        self.plans
            .try_send(PlanJob {
                cursor: PlanCursor::new(plan, self.sample_rate as f32),
                reports: tx,
            })
            .map_err(|e| CadenceError::backend(self.kind.as_str(), e.to_string()))?;
        Ok(Some(rx))
    }

    fn cancel_sequence(&mut self) -> Result<()> {
        self.state.cancel_plan.store(true, Ordering::Release);
        self.stop()
    }
}

impl Drop for NativeTone {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn build_stream(
    kind: BackendKind,
    buffer: BufferRequest,
    state: Arc<KeyState>,
    plans: Receiver<PlanJob>,
    clock: SharedClock,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| CadenceError::AudioDevice("no default output device".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| CadenceError::AudioDevice(e.to_string()))?;

    let buffer_size = match buffer {
        BufferRequest::Default => BufferSize::Default,
        BufferRequest::Fixed(frames) => match supported.buffer_size() {
            SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&frames) => {
                BufferSize::Fixed(frames)
            }
            other => {
                return Err(CadenceError::AudioDevice(format!(
                    "fixed buffer of {frames} frames outside device range {other:?}"
                )))
            }
        },
    };

    let sample_rate = supported.sample_rate().0;
    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size,
    };
    debug!(
        backend = kind.as_str(),
        device = device.name().unwrap_or_default().as_str(),
        sample_rate,
        channels = config.channels,
        ?buffer_size,
        "building tone stream"
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_typed::<f32>(&device, &config, kind, state, plans, clock),
        SampleFormat::I16 => build_typed::<i16>(&device, &config, kind, state, plans, clock),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, kind, state, plans, clock),
        other => Err(CadenceError::AudioStream(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| CadenceError::AudioStream(e.to_string()))?;
    Ok((stream, sample_rate))
}

fn build_typed<T: SizedSample + FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    kind: BackendKind,
    state: Arc<KeyState>,
    plans: Receiver<PlanJob>,
    clock: SharedClock,
) -> Result<Stream> {
    let channels = usize::from(config.channels.max(1));
    let ms_per_frame = 1000.0 / f64::from(config.sample_rate.0.max(1));
    let mut generator = SidetoneGenerator::new(state.hz(), state.gain(), config.sample_rate.0 as f32);
    let mut active: Option<PlanJob> = None;
    let error_state = Arc::clone(&state);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
                if state.cancel_plan.swap(false, Ordering::AcqRel) {
                    active = None;
                }
                while let Ok(job) = plans.try_recv() {
                    active = Some(job);
                }

                let stamp = info.timestamp();
                let output_latency_ms = stamp
                    .playback
                    .duration_since(&stamp.callback)
                    .map_or(0.0, |d| d.as_secs_f64() * 1000.0);
                let first_frame_ms = clock.now_ms() + output_latency_ms;

                generator.set_frequency(state.hz());
                generator.set_gain(state.gain());
                let manual_key = state.key_down.load(Ordering::Acquire);

                for (i, frame) in data.chunks_mut(channels).enumerate() {
                    let frame_ms = first_frame_ms + i as f64 * ms_per_frame;
                    let key_down = match active.as_mut() {
                        Some(PlanJob { cursor, reports }) => {
                            let position = cursor.position();
                            cursor.step(|event| {
                                let report = match event {
                                    CursorEvent::Announce { sequence, start_sample } => BackendReport {
                                        sequence,
                                        phase: DispatchPhase::Scheduled,
                                        timestamp_ms: frame_ms
                                            + (start_sample.saturating_sub(position)) as f64 * ms_per_frame,
                                        duration_ms: None,
                                    },
                                    CursorEvent::Start { sequence, length, .. } => BackendReport {
                                        sequence,
                                        phase: DispatchPhase::Actual,
                                        timestamp_ms: frame_ms,
                                        duration_ms: Some(length as f64 * ms_per_frame),
                                    },
                                };
                                let _ = reports.try_send(report);
                            })
                        }
                        None => manual_key,
                    };
                    let value = T::from_sample(generator.next_sample(key_down));
                    for sample in frame.iter_mut() {
                        *sample = value;
                    }
                }

                if active.as_ref().is_some_and(|job| job.cursor.is_finished()) {
                    active = None;
                }
            },
            move |err| {
                error_state.failed.store(true, Ordering::Relaxed);
                warn!(backend = kind.as_str(), "tone stream error: {err}");
            },
            None,
        )
        .map_err(|e| CadenceError::AudioStream(e.to_string()))
}

/// Small fixed-buffer stream. Platform gated unless force-enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowLatencyProbe;

impl BackendProbe for LowLatencyProbe {
    fn name(&self) -> &'static str {
        BackendKind::LowLatency.as_str()
    }

    fn probe(&self, ctx: &ProbeContext) -> Option<Box<dyn ToneController>> {
        match ctx.low_latency_override {
            Some(false) => {
                debug!("low-latency backend disabled by override");
                return None;
            }
            None if !LOW_LATENCY_PLATFORM => return None,
            _ => {}
        }
        match NativeTone::open(
            BackendKind::LowLatency,
            ctx,
            BufferRequest::Fixed(ctx.low_latency_frames),
        ) {
            Ok(tone) => Some(Box::new(tone)),
            Err(e) => {
                debug!("low-latency backend unavailable: {e}");
                None
            }
        }
    }
}

/// Default-buffer stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamProbe;

impl BackendProbe for StreamProbe {
    fn name(&self) -> &'static str {
        BackendKind::Stream.as_str()
    }

    fn probe(&self, ctx: &ProbeContext) -> Option<Box<dyn ToneController>> {
        match NativeTone::open(BackendKind::Stream, ctx, BufferRequest::Default) {
            Ok(tone) => Some(Box::new(tone)),
            Err(e) => {
                debug!("stream backend unavailable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    fn ctx(low_latency_override: Option<bool>) -> ProbeContext {
        ProbeContext {
            clock: MonotonicClock::shared(),
            hz: 600.0,
            gain: 0.5,
            low_latency_override,
            low_latency_frames: 128,
        }
    }

    #[test]
    fn forced_off_low_latency_never_opens() {
        assert!(LowLatencyProbe.probe(&ctx(Some(false))).is_none());
    }

    #[test]
    fn low_latency_respects_platform_gate() {
        if !LOW_LATENCY_PLATFORM {
            assert!(LowLatencyProbe.probe(&ctx(None)).is_none());
        }
    }

    #[test]
    fn key_state_round_trips_floats() {
        let state = KeyState::new(612.5, 1.7);
        assert_eq!(state.hz(), 612.5);
        assert_eq!(state.gain(), 1.0);
    }
}
