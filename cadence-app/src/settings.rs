//! Persistent host settings (JSON file in the app data directory).
//!
//! The engine only ever sees the `SettingsSnapshot` carried in `engine`;
//! the rest configures the host itself.

use std::fs;
use std::path::{Path, PathBuf};

use cadence_core::SettingsSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub engine: SettingsSnapshot,
    /// Low-latency backend switch. `None` defers to `CADENCE_LOW_LATENCY`,
    /// then the platform gate.
    pub low_latency: Option<bool>,
    /// Characters used by `drill` when none are given.
    pub drill_chars: String,
    /// Scale applied to every keyed duration in `drill`. 1.0 keys perfectly.
    pub drill_stretch: f64,
    pub challenge_lives: u32,
    /// Where `diagnostics` writes bundles. `None` → next to the settings file.
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine: SettingsSnapshot::default(),
            low_latency: None,
            drill_chars: "ETIANMSURWDKGO".into(),
            drill_stretch: 1.0,
            challenge_lives: 3,
            diagnostics_dir: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.engine.normalize();
        self.drill_chars = normalize_drill_chars(&self.drill_chars);
        if !self.drill_stretch.is_finite() {
            self.drill_stretch = 1.0;
        }
        self.drill_stretch = self.drill_stretch.clamp(0.25, 4.0);
        self.challenge_lives = self.challenge_lives.clamp(1, 10);
        self.diagnostics_dir = self
            .diagnostics_dir
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }
}

fn normalize_drill_chars(raw: &str) -> String {
    let chars: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| cadence_core::timing::pattern_for_char(*c).is_some())
        .collect();
    if chars.is_empty() {
        AppSettings::default().drill_chars
    } else {
        chars
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Cadence")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("cadence")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
