//! Read-only settings snapshot supplied by the presentation layer.
//!
//! The engine never persists this; callers re-supply a fresh snapshot
//! whenever their configuration changes.

use serde::{Deserialize, Serialize};

use crate::timing::{Tolerance, TimingModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SettingsSnapshot {
    pub wpm: f64,
    pub tone_hz: f32,
    pub audio_enabled: bool,
    pub haptics_enabled: bool,
    pub light_enabled: bool,
    pub torch_enabled: bool,
    pub audio_volume_percent: f32,
    pub flash_brightness_percent: f32,
    pub signal_tolerance_percent: f64,
    pub gap_tolerance_percent: f64,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            wpm: 12.0,
            tone_hz: 600.0,
            audio_enabled: true,
            haptics_enabled: true,
            light_enabled: false,
            torch_enabled: false,
            audio_volume_percent: 80.0,
            flash_brightness_percent: 80.0,
            signal_tolerance_percent: 35.0,
            gap_tolerance_percent: 50.0,
        }
    }
}

impl SettingsSnapshot {
    pub fn normalize(&mut self) {
        if !self.wpm.is_finite() {
            self.wpm = Self::default().wpm;
        }
        self.wpm = self.wpm.clamp(5.0, 60.0);
        if !self.tone_hz.is_finite() {
            self.tone_hz = Self::default().tone_hz;
        }
        self.tone_hz = self.tone_hz.clamp(200.0, 1500.0);
        self.audio_volume_percent = clamp_percent(self.audio_volume_percent);
        self.flash_brightness_percent = clamp_percent(self.flash_brightness_percent);
        self.signal_tolerance_percent = self.signal_tolerance_percent.clamp(5.0, 90.0);
        self.gap_tolerance_percent = self.gap_tolerance_percent.clamp(5.0, 90.0);
    }

    /// Copy with every field clamped into range.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn timing(&self) -> TimingModel {
        TimingModel::from_wpm(self.wpm)
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance::from_percent(self.signal_tolerance_percent, self.gap_tolerance_percent)
    }

    /// Output gain in `[0.0, 1.0]`.
    pub fn audio_gain(&self) -> f32 {
        clamp_percent(self.audio_volume_percent) / 100.0
    }
}

fn clamp_percent(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let raw = r#"{"wpm": 20, "torchEnabled": true, "flashBrightnessPercent": 40}"#;
        let settings: SettingsSnapshot = serde_json::from_str(raw).expect("parse settings");
        assert_eq!(settings.wpm, 20.0);
        assert!(settings.torch_enabled);
        assert_eq!(settings.flash_brightness_percent, 40.0);
        assert_eq!(settings.tone_hz, SettingsSnapshot::default().tone_hz);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let settings = SettingsSnapshot {
            wpm: 400.0,
            tone_hz: f32::NAN,
            audio_volume_percent: 180.0,
            flash_brightness_percent: -5.0,
            signal_tolerance_percent: 1.0,
            gap_tolerance_percent: 99.0,
            ..SettingsSnapshot::default()
        }
        .normalized();
        assert_eq!(settings.wpm, 60.0);
        assert_eq!(settings.tone_hz, 600.0);
        assert_eq!(settings.audio_volume_percent, 100.0);
        assert_eq!(settings.flash_brightness_percent, 0.0);
        assert_eq!(settings.signal_tolerance_percent, 5.0);
        assert_eq!(settings.gap_tolerance_percent, 90.0);
    }

    #[test]
    fn derived_timing_and_tolerance() {
        let settings = SettingsSnapshot::default();
        assert!((settings.timing().unit_ms() - 100.0).abs() < 1e-9);
        assert!((settings.tolerance().signal - 0.35).abs() < 1e-9);
        assert!((settings.audio_gain() - 0.8).abs() < 1e-6);
    }
}
