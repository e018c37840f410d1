//! Duration classifier: measured press/silence lengths → symbols and gaps.
//!
//! Signals use fixed windows around 1 and 3 units. Gaps use "nearest target
//! wins": the relative error against 1, 3 and 7 units is computed and the
//! smallest one is accepted only if it is within tolerance. Changing either
//! policy changes scoring.

use super::{MorseGap, MorseSymbol};

/// Lower bound for any tolerance fraction.
pub const MIN_TOLERANCE: f64 = 0.05;
/// Upper bound for any tolerance fraction.
pub const MAX_TOLERANCE: f64 = 0.90;

/// Clamp a tolerance fraction into `[0.05, 0.90]`.
pub fn clamp_tolerance(tolerance: f64) -> f64 {
    if tolerance.is_nan() {
        return MIN_TOLERANCE;
    }
    tolerance.clamp(MIN_TOLERANCE, MAX_TOLERANCE)
}

/// Signal and gap tolerances as clamped fractions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub signal: f64,
    pub gap: f64,
}

impl Tolerance {
    pub fn new(signal: f64, gap: f64) -> Self {
        Self {
            signal: clamp_tolerance(signal),
            gap: clamp_tolerance(gap),
        }
    }

    /// Build from the percentage values carried by the settings snapshot.
    pub fn from_percent(signal_percent: f64, gap_percent: f64) -> Self {
        Self::new(signal_percent / 100.0, gap_percent / 100.0)
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::new(0.35, 0.5)
    }
}

/// Classify a key-down duration as a dot or dash.
///
/// `None` means the press falls between or outside both windows; callers
/// treat that as a failed attempt.
pub fn classify_signal(duration_ms: f64, unit_ms: f64, tolerance: f64) -> Option<MorseSymbol> {
    if !duration_ms.is_finite() || !unit_ms.is_finite() || unit_ms <= 0.0 || duration_ms < 0.0 {
        return None;
    }
    let tol = clamp_tolerance(tolerance);

    if duration_ms <= unit_ms * (1.0 + tol) {
        return Some(MorseSymbol::Dot);
    }

    let dash = unit_ms * 3.0;
    if duration_ms >= dash * (1.0 - tol) && duration_ms <= dash * (1.0 + tol) {
        return Some(MorseSymbol::Dash);
    }

    None
}

/// Classify a silence between presses.
pub fn classify_gap(duration_ms: f64, unit_ms: f64, tolerance: f64) -> Option<MorseGap> {
    if !duration_ms.is_finite() || !unit_ms.is_finite() || unit_ms <= 0.0 || duration_ms < 0.0 {
        return None;
    }
    let tol = clamp_tolerance(tolerance);

    let (gap, error) = MorseGap::ALL
        .iter()
        .map(|&gap| {
            let target = unit_ms * gap.units() as f64;
            (gap, (duration_ms - target).abs() / target)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))?;

    (error <= tol).then_some(gap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCES: [f64; 6] = [0.05, 0.1, 0.25, 0.5, 0.75, 0.9];

    #[test]
    fn exact_unit_is_dot_and_triple_unit_is_dash() {
        for unit in [10.0, 48.0, 60.0, 100.0, 240.0] {
            for tol in TOLERANCES {
                assert_eq!(classify_signal(unit, unit, tol), Some(MorseSymbol::Dot));
                assert_eq!(
                    classify_signal(3.0 * unit, unit, tol),
                    Some(MorseSymbol::Dash),
                    "unit={unit} tol={tol}"
                );
            }
        }
    }

    #[test]
    fn twelve_wpm_examples() {
        // dot upper bound = 130, dash window = [210, 390]
        assert_eq!(classify_signal(95.0, 100.0, 0.3), Some(MorseSymbol::Dot));
        assert_eq!(classify_signal(280.0, 100.0, 0.3), Some(MorseSymbol::Dash));
        assert_eq!(classify_signal(200.0, 100.0, 0.3), None);
        assert_eq!(classify_signal(130.0, 100.0, 0.3), Some(MorseSymbol::Dot));
        assert_eq!(classify_signal(390.0, 100.0, 0.3), Some(MorseSymbol::Dash));
        assert_eq!(classify_signal(391.0, 100.0, 0.3), None);
    }

    #[test]
    fn tolerance_is_clamped() {
        // 0.01 behaves like 0.05: dot upper = 105
        assert_eq!(classify_signal(104.0, 100.0, 0.01), Some(MorseSymbol::Dot));
        assert_eq!(classify_signal(106.0, 100.0, 0.01), None);
        // 5.0 behaves like 0.9: dot upper = 190
        assert_eq!(classify_signal(189.0, 100.0, 5.0), Some(MorseSymbol::Dot));
    }

    #[test]
    fn degenerate_inputs_are_unclassifiable() {
        assert_eq!(classify_signal(100.0, 0.0, 0.3), None);
        assert_eq!(classify_signal(f64::NAN, 100.0, 0.3), None);
        assert_eq!(classify_gap(100.0, -1.0, 0.3), None);
        assert_eq!(classify_gap(-5.0, 100.0, 0.3), None);
    }

    #[test]
    fn gap_nearest_target_wins() {
        assert_eq!(classify_gap(100.0, 100.0, 0.3), Some(MorseGap::Intra));
        assert_eq!(classify_gap(300.0, 100.0, 0.3), Some(MorseGap::Inter));
        assert_eq!(classify_gap(700.0, 100.0, 0.3), Some(MorseGap::Word));
        // 180ms: error vs 100 = 0.8, vs 300 = 0.4 → Inter is nearest but over 0.3
        assert_eq!(classify_gap(180.0, 100.0, 0.3), None);
        assert_eq!(classify_gap(180.0, 100.0, 0.45), Some(MorseGap::Inter));
        // 500ms: vs 300 = 0.667, vs 700 = 0.286 → Word
        assert_eq!(classify_gap(500.0, 100.0, 0.3), Some(MorseGap::Word));
    }

    #[test]
    fn gap_classification_is_scale_invariant() {
        for k in [1.0, 3.0, 7.0] {
            for tol in TOLERANCES {
                let base = classify_gap(k * 60.0, 60.0, tol);
                for unit in [10.0, 33.3, 100.0, 240.0] {
                    assert_eq!(classify_gap(k * unit, unit, tol), base, "k={k} unit={unit}");
                }
            }
        }
    }

    #[test]
    fn tolerance_from_percent() {
        let tol = Tolerance::from_percent(30.0, 200.0);
        assert!((tol.signal - 0.3).abs() < 1e-9);
        assert!((tol.gap - MAX_TOLERANCE).abs() < 1e-9);
    }
}
