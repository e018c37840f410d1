//! Cadence headless host.
//!
//! Stands in for a presentation layer: loads the settings file, builds the
//! engine, and drives it from the command line.
//!
//! ```text
//! cadence play [TEXT...]          play text (default "PARIS")
//! cadence drill [CHARS]           play each character, key it back, score it
//! cadence diagnostics [PATH]      calibration run, then export a JSON bundle
//! cadence settings                print the settings file (writing defaults)
//! ```

mod drill;
mod settings;

use std::path::{Path, PathBuf};

use anyhow::Context;
use cadence_core::engine::{CadenceEngine, EngineConfig};
use cadence_core::{ChannelState, PlaybackOutcome, SymbolEvent};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::sync::broadcast;
use tracing::{info, warn};

const CALIBRATION_TEXT: &str = "PARIS";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Play(String),
    Drill(Option<String>),
    Diagnostics(Option<PathBuf>),
    Settings,
}

fn parse_command(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let Some(name) = args.next() else {
        return Ok(Command::Play(CALIBRATION_TEXT.into()));
    };
    let rest: Vec<String> = args.collect();
    match name.as_str() {
        "play" => {
            let text = rest.join(" ");
            Ok(Command::Play(if text.trim().is_empty() {
                CALIBRATION_TEXT.into()
            } else {
                text
            }))
        }
        "drill" => Ok(Command::Drill(rest.first().cloned())),
        "diagnostics" => Ok(Command::Diagnostics(rest.first().map(PathBuf::from))),
        "settings" => Ok(Command::Settings),
        other => anyhow::bail!("unknown command {other:?} (expected play, drill, diagnostics or settings)"),
    }
}

fn engine_config(settings: &AppSettings) -> EngineConfig {
    EngineConfig {
        low_latency_override: settings.low_latency,
        challenge_lives: settings.challenge_lives,
        ..EngineConfig::default()
    }
}

fn build_engine(settings: &AppSettings) -> CadenceEngine {
    let config = engine_config(settings);
    let engine = CadenceEngine::new(config, settings.engine.clone());
    match engine.audio_state() {
        ChannelState::Ready(kind) => info!(backend = kind.as_str(), "tone backend ready"),
        ChannelState::Unavailable if settings.engine.audio_enabled => {
            warn!("no tone backend available; continuing with audio disabled");
            let mut snapshot = engine.settings();
            snapshot.audio_enabled = false;
            engine.update_settings(snapshot);
        }
        ChannelState::Unavailable => {}
    }
    engine
}

/// Log every symbol event as JSON until the channel closes.
fn forward_symbols(mut rx: broadcast::Receiver<SymbolEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "cadence::symbols", "{json}"),
                    Err(e) => warn!("symbol event not serializable: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "symbol log lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn play(engine: &CadenceEngine, text: &str) -> anyhow::Result<()> {
    let outcome = engine.play_text(text, engine.unit_ms()).await?;
    info!(?outcome, text, "playback finished");
    if outcome == PlaybackOutcome::Cancelled {
        warn!("playback was cancelled");
    }
    Ok(())
}

fn print_diagnostics(engine: &CadenceEngine) -> anyhow::Result<()> {
    for snapshot in engine.diagnostics_snapshot() {
        println!(
            "{:<7} n={:<4} mean={:>7.2}ms p50={:>7.2}ms p95={:>7.2}ms jitter={:>6.2}ms failures={}",
            snapshot.channel.as_str(),
            snapshot.count,
            snapshot.mean_ms,
            snapshot.p50_ms,
            snapshot.p95_ms,
            snapshot.jitter_ms,
            snapshot.failures,
        );
    }
    let anomalies = engine.timing_anomalies();
    if !anomalies.is_empty() {
        println!("{}", serde_json::to_string_pretty(&anomalies)?);
    }
    Ok(())
}

async fn run_drill(engine: &CadenceEngine, settings: &AppSettings, chars: Option<String>) -> anyhow::Result<()> {
    let chars = chars.unwrap_or_else(|| settings.drill_chars.clone());
    match drill::run(engine, &chars.to_ascii_uppercase(), settings.drill_stretch).await? {
        Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        None => println!("drill produced no score"),
    }
    Ok(())
}

async fn run_diagnostics(
    engine: &CadenceEngine,
    settings: &AppSettings,
    settings_path: &Path,
    path: Option<PathBuf>,
) -> anyhow::Result<()> {
    play(engine, CALIBRATION_TEXT).await?;
    print_diagnostics(engine)?;
    let path = path.unwrap_or_else(|| {
        let dir = settings.diagnostics_dir.clone().unwrap_or_else(|| {
            settings_path
                .parent()
                .map(|p| p.join("diagnostics"))
                .unwrap_or_else(|| PathBuf::from("diagnostics"))
        });
        dir.join(format!("cadence-{}.json", chrono::Utc::now().format("%Y%m%dT%H%M%SZ")))
    });
    engine.export_diagnostics(&path)?;
    println!("diagnostics written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence=info")),
        )
        .init();

    let command = parse_command(std::env::args().skip(1))?;

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    info!(path = %settings_path.display(), wpm = settings.engine.wpm, "Cadence starting");

    if command == Command::Settings {
        if !settings_path.exists() {
            save_settings(&settings_path, &settings)
                .with_context(|| format!("writing {}", settings_path.display()))?;
        }
        println!("{}", settings_path.display());
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    let engine = build_engine(&settings);
    let forwarder = forward_symbols(engine.subscribe_symbols());

    let result = match command {
        Command::Play(text) => play(&engine, &text).await,
        Command::Drill(chars) => run_drill(&engine, &settings, chars).await,
        Command::Diagnostics(path) => run_diagnostics(&engine, &settings, &settings_path, path).await,
        Command::Settings => Ok(()),
    };

    engine.shutdown();
    drop(engine);
    forwarder.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> impl Iterator<Item = String> {
        raw.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn no_arguments_plays_calibration_word() {
        assert_eq!(parse_command(args(&[])).unwrap(), Command::Play("PARIS".into()));
    }

    #[test]
    fn play_joins_remaining_words() {
        assert_eq!(
            parse_command(args(&["play", "CQ", "DE", "K1ABC"])).unwrap(),
            Command::Play("CQ DE K1ABC".into())
        );
    }

    #[test]
    fn drill_and_diagnostics_take_optional_argument() {
        assert_eq!(parse_command(args(&["drill"])).unwrap(), Command::Drill(None));
        assert_eq!(
            parse_command(args(&["diagnostics", "out.json"])).unwrap(),
            Command::Diagnostics(Some(PathBuf::from("out.json")))
        );
    }

    #[test]
    fn settings_switch_reaches_engine_config() {
        let settings = AppSettings {
            low_latency: Some(false),
            challenge_lives: 5,
            ..AppSettings::default()
        };
        let config = engine_config(&settings);
        assert_eq!(config.low_latency_override, Some(false));
        assert_eq!(config.challenge_lives, 5);
        assert_eq!(engine_config(&AppSettings::default()).low_latency_override, None);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(parse_command(args(&["record"])).is_err());
    }
}
