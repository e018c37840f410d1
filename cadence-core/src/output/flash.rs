//! Screen flash channel.
//!
//! A flash ramps up to a brightness-derived ceiling over a short attack and
//! then fades linearly to zero. The host renders whatever intensity it is handed; this module only
//! decides the curve and the frame timing.

use std::sync::Arc;
use std::time::Duration;

use crate::playback::Generation;

/// Minimum visible intensity at 0 % brightness.
pub const FLASH_FLOOR: f32 = 0.25;
/// Intensity at 100 % brightness.
pub const FLASH_CEIL: f32 = 1.0;
/// Perceptual exponent applied to the brightness fraction.
pub const FLASH_GAMMA: f32 = 0.45;

pub const MIN_FADE_MS: f64 = 120.0;
pub const MAX_FADE_MS: f64 = 240.0;
const FADE_FRACTION: f64 = 0.35;

/// Frame cadence for ramp and fade updates (~60 Hz).
pub const FRAME_MS: u64 = 16;

/// Frames spent ramping up to the peak, the first one shown at ignition.
pub const ATTACK_FRAMES: u64 = 2;

/// Overlay the host draws. Values are in `[0.0, 1.0]`.
pub trait FlashSurface: Send + Sync + 'static {
    fn set_intensity(&self, intensity: f32);
}

/// Surface for hosts without a flash overlay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlash;

impl FlashSurface for NoopFlash {
    fn set_intensity(&self, _intensity: f32) {}
}

/// Brightness percent → peak intensity on a gamma curve.
pub fn flash_ceiling(brightness_percent: f32) -> f32 {
    let fraction = if brightness_percent.is_nan() {
        0.0
    } else {
        (brightness_percent / 100.0).clamp(0.0, 1.0)
    };
    FLASH_FLOOR + (FLASH_CEIL - FLASH_FLOOR) * fraction.powf(FLASH_GAMMA)
}

/// Fade length for a symbol of `duration_ms`.
pub fn fade_ms(duration_ms: f64) -> f64 {
    (FADE_FRACTION * duration_ms).clamp(MIN_FADE_MS, MAX_FADE_MS)
}

/// Intensity on attack frame `step` (1-based); `ATTACK_FRAMES` reaches `peak`.
pub fn attack_intensity(peak: f32, step: u64) -> f32 {
    let step = step.clamp(1, ATTACK_FRAMES);
    peak * step as f32 / ATTACK_FRAMES as f32
}

/// Intensity `elapsed_ms` into a fade that started at `peak`.
pub fn fade_intensity(peak: f32, elapsed_ms: f64, fade_ms: f64) -> f32 {
    if fade_ms <= 0.0 || elapsed_ms >= fade_ms {
        return 0.0;
    }
    let remaining = 1.0 - (elapsed_ms / fade_ms).max(0.0);
    peak * remaining as f32
}

/// Drives one flash at a time on a surface. A newer flash supersedes the
/// running fade through the shared generation token.
pub struct FlashAnimator {
    surface: Arc<dyn FlashSurface>,
    generation: Generation,
}

impl FlashAnimator {
    pub fn new(surface: Arc<dyn FlashSurface>) -> Self {
        Self {
            surface,
            generation: Generation::new(),
        }
    }

    /// Show the first attack frame now and return the token owning the ramp.
    pub fn ignite(&self, peak: f32) -> u64 {
        let token = self.generation.advance();
        self.surface.set_intensity(attack_intensity(peak.clamp(0.0, 1.0), 1));
        token
    }

    /// Finish the attack up to `peak`, then fade to zero over `fade_ms`.
    /// Stops early if superseded.
    pub async fn ramp_and_fade(&self, token: u64, peak: f32, fade_ms: f64) {
        let peak = peak.clamp(0.0, 1.0);
        let start = tokio::time::Instant::now();
        let mut frame = 1u64;
        loop {
            let deadline = start + Duration::from_millis(FRAME_MS * frame);
            if !self.generation.sleep_until(token, deadline).await {
                return;
            }
            if frame < ATTACK_FRAMES {
                self.surface.set_intensity(attack_intensity(peak, frame + 1));
                frame += 1;
                continue;
            }
            let elapsed = (FRAME_MS * (frame + 1 - ATTACK_FRAMES)) as f64;
            let intensity = fade_intensity(peak, elapsed, fade_ms);
            self.surface.set_intensity(intensity);
            if intensity <= 0.0 {
                return;
            }
            frame += 1;
        }
    }

    /// Blank the surface and cancel any running fade.
    pub fn cut(&self) {
        self.generation.advance();
        self.surface.set_intensity(0.0);
    }

    /// Hold a steady intensity (live keying) until `cut` or the next flash.
    pub fn hold(&self, intensity: f32) {
        self.generation.advance();
        self.surface.set_intensity(intensity.clamp(0.0, 1.0));
    }
}
