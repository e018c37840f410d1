//! Scripted keyer drill: plays each character, then keys it back through
//! the keyer with synthetic timestamps and collects the verdicts.

use std::time::Duration;

use anyhow::{anyhow, Context};
use cadence_core::timing::pattern_for_char;
use cadence_core::{CadenceEngine, MorseGap, ScoreSummary, VerdictEvent};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Upper bound on waiting for a verdict after the last release.
const VERDICT_WAIT: Duration = Duration::from_secs(3);

/// Press windows `(start, end)` keying `pattern` from `start_ms`, every
/// duration scaled by `stretch`.
pub fn press_script(pattern: &cadence_core::Pattern, unit_ms: f64, start_ms: f64, stretch: f64) -> Vec<(f64, f64)> {
    let mut at = start_ms;
    let mut presses = Vec::with_capacity(pattern.len());
    for symbol in pattern {
        let held = unit_ms * symbol.units() as f64 * stretch;
        presses.push((at, at + held));
        at += held + unit_ms * stretch;
    }
    presses
}

pub async fn run(engine: &CadenceEngine, chars: &str, stretch: f64) -> anyhow::Result<Option<ScoreSummary>> {
    let targets: Vec<char> = chars.chars().filter(|c| pattern_for_char(*c).is_some()).collect();
    if targets.is_empty() {
        return Err(anyhow!("no drillable characters in {chars:?}"));
    }
    let mut verdicts = engine.subscribe_verdicts();
    engine.start_challenge(targets.len() as u32);

    for c in targets {
        let pattern = pattern_for_char(c).context("character table changed underneath the drill")?;
        let unit_ms = engine.unit_ms();

        engine.play_morse(&pattern, unit_ms).await?;
        engine.play_gap(MorseGap::Word, unit_ms).await;

        let attempt = match engine.begin_attempt(pattern.clone()) {
            Ok(attempt) => attempt,
            Err(e) => {
                info!("drill stopped: {e}");
                break;
            }
        };
        let now = engine.clock().now_ms();
        for (start, end) in press_script(&pattern, unit_ms, now, stretch) {
            engine.press_start(Some(start));
            engine.press_end(Some(end))?;
        }

        let verdict = next_verdict(&mut verdicts).await?;
        info!(
            character = %c,
            attempt,
            verdict = ?verdict.verdict,
            reason = ?verdict.reason,
            received = verdict.received.as_str(),
            "drill attempt"
        );
        if let Some(summary) = verdict.summary {
            return Ok(Some(summary));
        }
    }
    Ok(engine.end_session())
}

async fn next_verdict(rx: &mut broadcast::Receiver<VerdictEvent>) -> anyhow::Result<VerdictEvent> {
    let deadline = tokio::time::Instant::now() + VERDICT_WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => return Ok(event),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                warn!(skipped = n, "verdict receiver lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(anyhow!("verdict channel closed"));
            }
            Err(_) => return Err(anyhow!("no verdict within {VERDICT_WAIT:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::Pattern;

    #[test]
    fn script_keys_canonical_durations() {
        let k = Pattern::parse("-.-").unwrap();
        assert_eq!(
            press_script(&k, 100.0, 1_000.0, 1.0),
            vec![(1_000.0, 1_300.0), (1_400.0, 1_500.0), (1_600.0, 1_900.0)]
        );
    }

    #[test]
    fn stretch_scales_presses_and_gaps() {
        let a = Pattern::parse(".-").unwrap();
        assert_eq!(
            press_script(&a, 100.0, 0.0, 2.0),
            vec![(0.0, 200.0), (400.0, 1_000.0)]
        );
    }
}
