//! Output dispatcher: fans one symbol-start event out to haptic, flash and
//! torch channels.
//!
//! Channels are independent. Each one checks its own enable flag, does its
//! work, records `now - requested_at` into the latency store, and swallows
//! its own failure (recorded, logged) so the others still fire. Timed parts
//! (flash fade, torch hold) run as spawned tasks and never block the caller.

pub mod flash;
pub mod haptics;
pub mod torch;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;
use crate::diagnostics::LatencyStore;
use crate::playback::{Generation, SymbolContext};
use crate::settings::SettingsSnapshot;
use crate::timing::MorseSymbol;

pub use flash::{fade_ms, flash_ceiling, FlashAnimator, FlashSurface, NoopFlash};
pub use haptics::{HapticDriver, HapticIntensity, NoopHaptics};
pub use torch::{TorchDriver, TorchGuard, TorchLock, UnsupportedTorch};

/// Output channel tag used by the dispatcher, diagnostics and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    Audio,
    Haptic,
    Flash,
    Torch,
}

impl OutputChannel {
    pub const COUNT: usize = 4;
    pub const ALL: [OutputChannel; Self::COUNT] = [
        OutputChannel::Audio,
        OutputChannel::Haptic,
        OutputChannel::Flash,
        OutputChannel::Torch,
    ];

    pub fn index(self) -> usize {
        match self {
            OutputChannel::Audio => 0,
            OutputChannel::Haptic => 1,
            OutputChannel::Flash => 2,
            OutputChannel::Torch => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputChannel::Audio => "audio",
            OutputChannel::Haptic => "haptic",
            OutputChannel::Flash => "flash",
            OutputChannel::Torch => "torch",
        }
    }
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel enable flags and scaling, derived from the settings snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatcherOptions {
    pub haptics_enabled: bool,
    pub flash_enabled: bool,
    pub torch_enabled: bool,
    pub flash_brightness_percent: f32,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&SettingsSnapshot::default())
    }
}

impl From<&SettingsSnapshot> for DispatcherOptions {
    fn from(settings: &SettingsSnapshot) -> Self {
        Self {
            haptics_enabled: settings.haptics_enabled,
            flash_enabled: settings.light_enabled,
            torch_enabled: settings.torch_enabled,
            flash_brightness_percent: settings.flash_brightness_percent,
        }
    }
}

/// Platform drivers behind the dispatcher.
#[derive(Clone)]
pub struct OutputDrivers {
    pub haptics: Arc<dyn HapticDriver>,
    pub flash: Arc<dyn FlashSurface>,
    pub torch: Arc<dyn TorchDriver>,
}

impl Default for OutputDrivers {
    fn default() -> Self {
        Self {
            haptics: Arc::new(NoopHaptics),
            flash: Arc::new(NoopFlash),
            torch: Arc::new(UnsupportedTorch),
        }
    }
}

impl fmt::Debug for OutputDrivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputDrivers").finish_non_exhaustive()
    }
}

/// What happened on one channel for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOutcome {
    Disabled,
    Fired,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub haptic: ChannelOutcome,
    pub flash: ChannelOutcome,
    pub torch: ChannelOutcome,
}

pub struct OutputDispatcher {
    clock: SharedClock,
    diagnostics: Arc<LatencyStore>,
    options: RwLock<DispatcherOptions>,
    haptics: Arc<dyn HapticDriver>,
    flash: Arc<FlashAnimator>,
    torch: Arc<TorchLock>,
    /// Advanced by `cut_active_outputs`; pending torch holds watch it.
    holds: Generation,
    /// Torch hold owned by live keying, if any.
    live_torch: Mutex<Option<TorchGuard>>,
}

impl OutputDispatcher {
    pub fn new(
        clock: SharedClock,
        diagnostics: Arc<LatencyStore>,
        drivers: OutputDrivers,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            clock,
            diagnostics,
            options: RwLock::new(options),
            haptics: drivers.haptics,
            flash: Arc::new(FlashAnimator::new(drivers.flash)),
            torch: TorchLock::new(drivers.torch),
            holds: Generation::new(),
            live_torch: Mutex::new(None),
        }
    }

    pub fn update_options(&self, settings: &SettingsSnapshot) {
        *self.options.write() = DispatcherOptions::from(settings);
    }

    pub fn options(&self) -> DispatcherOptions {
        *self.options.read()
    }

    /// Shared torch lock, for other consumers that want to hold the torch.
    pub fn torch(&self) -> &Arc<TorchLock> {
        &self.torch
    }

    /// Fire every enabled channel for one symbol-start event.
    pub fn dispatch(&self, symbol: MorseSymbol, duration_ms: f64, ctx: &SymbolContext) -> DispatchReport {
        let options = self.options();
        let report = DispatchReport {
            haptic: self.fire_haptic(&options, symbol, ctx),
            flash: self.fire_flash(&options, duration_ms, ctx),
            torch: self.fire_torch(&options, duration_ms, ctx),
        };
        debug!(
            correlation_id = ctx.correlation_id.as_str(),
            ?symbol,
            ?report,
            "symbol dispatched"
        );
        report
    }

    fn fire_haptic(&self, options: &DispatcherOptions, symbol: MorseSymbol, ctx: &SymbolContext) -> ChannelOutcome {
        if !options.haptics_enabled {
            return ChannelOutcome::Disabled;
        }
        match self.haptics.pulse(HapticIntensity::for_symbol(symbol)) {
            Ok(()) => {
                self.record(OutputChannel::Haptic, ctx);
                ChannelOutcome::Fired
            }
            Err(e) => {
                self.diagnostics
                    .record_failure(OutputChannel::Haptic, e.to_string());
                ChannelOutcome::Failed
            }
        }
    }

    fn fire_flash(&self, options: &DispatcherOptions, duration_ms: f64, ctx: &SymbolContext) -> ChannelOutcome {
        if !options.flash_enabled {
            return ChannelOutcome::Disabled;
        }
        let peak = flash_ceiling(options.flash_brightness_percent);
        let token = self.flash.ignite(peak);
        self.record(OutputChannel::Flash, ctx);

        let fade = fade_ms(duration_ms);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let flash = Arc::clone(&self.flash);
                handle.spawn(async move { flash.ramp_and_fade(token, peak, fade).await });
                ChannelOutcome::Fired
            }
            Err(_) => {
                self.flash.cut();
                self.diagnostics
                    .record_failure(OutputChannel::Flash, "no async runtime for fade");
                ChannelOutcome::Failed
            }
        }
    }

    fn fire_torch(&self, options: &DispatcherOptions, duration_ms: f64, ctx: &SymbolContext) -> ChannelOutcome {
        if !options.torch_enabled {
            return ChannelOutcome::Disabled;
        }
        let guard = match self.torch.acquire() {
            Ok(guard) => guard,
            Err(e) => {
                self.diagnostics
                    .record_failure(OutputChannel::Torch, e.to_string());
                return ChannelOutcome::Failed;
            }
        };
        self.record(OutputChannel::Torch, ctx);

        let token = self.holds.current();
        let holds = self.holds.clone();
        let hold = Duration::from_secs_f64(duration_ms.max(0.0) / 1000.0);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let deadline = tokio::time::Instant::now() + hold;
                    // Either the hold elapses or a cut advances the token; the
                    // guard is released on both paths.
                    let _ = holds.sleep_until(token, deadline).await;
                    guard.release();
                });
                ChannelOutcome::Fired
            }
            Err(_) => {
                guard.release();
                self.diagnostics
                    .record_failure(OutputChannel::Torch, "no async runtime for torch hold");
                ChannelOutcome::Failed
            }
        }
    }

    fn record(&self, channel: OutputChannel, ctx: &SymbolContext) {
        self.diagnostics.record_since(
            channel,
            ctx.requested_at_ms,
            Some(ctx.source.as_str()),
            Some(ctx.correlation_id.as_str()),
        );
    }

    /// Live keying: light the enabled visual channels while a key is held.
    pub fn live_press_start(&self) {
        let options = self.options();
        let requested_at = self.clock.now_ms();
        if options.haptics_enabled {
            if let Err(e) = self.haptics.pulse(HapticIntensity::Light) {
                self.diagnostics
                    .record_failure(OutputChannel::Haptic, e.to_string());
            } else {
                self.diagnostics
                    .record_since(OutputChannel::Haptic, requested_at, Some("keyer"), None);
            }
        }
        if options.flash_enabled {
            self.flash.hold(flash_ceiling(options.flash_brightness_percent));
        }
        if options.torch_enabled {
            let mut live = self.live_torch.lock();
            if live.is_none() {
                match self.torch.acquire() {
                    Ok(guard) => {
                        *live = Some(guard);
                        self.diagnostics
                            .record_since(OutputChannel::Torch, requested_at, Some("keyer"), None);
                    }
                    Err(e) => self
                        .diagnostics
                        .record_failure(OutputChannel::Torch, e.to_string()),
                }
            }
        }
    }

    /// Live keying: key released.
    pub fn live_press_end(&self) {
        self.flash.cut();
        self.live_torch.lock().take();
    }

    /// Drop every hold this dispatcher owns: torch holds (playback and live),
    /// flash overlay. Safe to call repeatedly.
    pub fn cut_active_outputs(&self, reason: &str) {
        debug!(reason, "cutting active outputs");
        self.holds.advance();
        self.flash.cut();
        if self.live_torch.lock().take().is_some() {
            debug!(reason, "released live torch hold");
        }
    }
}

impl fmt::Debug for OutputDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputDispatcher")
            .field("options", &self.options())
            .field("torch", &self.torch)
            .finish_non_exhaustive()
    }
}
