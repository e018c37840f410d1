//! Unit-based Morse timing model.
//!
//! Standard "PARIS" timing: one word = 50 units, so at N words per minute a
//! unit lasts `1200 / N` milliseconds. Everything else is a multiple of it:
//!
//! | Element   | Units |
//! |-----------|-------|
//! | dot       | 1     |
//! | dash      | 3     |
//! | intra gap | 1     |
//! | inter gap | 3     |
//! | word gap  | 7     |

pub mod classify;
pub mod table;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub use classify::{classify_gap, classify_signal, Tolerance};
pub use table::{char_for_pattern, pattern_for_char, text_to_patterns, TextElement};

/// Floor for the unit duration. Anything faster is not keyable by hand.
pub const MIN_UNIT_MS: f64 = 10.0;

/// Words per minute used when a caller hands in a non-positive speed.
pub const DEFAULT_WPM: f64 = 18.0;

/// Unit (dot) duration in milliseconds for a given speed.
pub fn unit_ms_from_wpm(wpm: f64) -> f64 {
    let wpm = if wpm.is_finite() && wpm > 0.0 {
        wpm
    } else {
        DEFAULT_WPM
    };
    (1200.0 / wpm).max(MIN_UNIT_MS)
}

/// Estimate words per minute from a unit duration in milliseconds.
pub fn estimate_wpm_from_unit(unit_ms: f64) -> f64 {
    1200.0 / unit_ms.max(MIN_UNIT_MS)
}

/// The atomic keyed/played element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MorseSymbol {
    Dot,
    Dash,
}

impl MorseSymbol {
    /// Length in units.
    pub fn units(self) -> u32 {
        match self {
            MorseSymbol::Dot => 1,
            MorseSymbol::Dash => 3,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            MorseSymbol::Dot => '.',
            MorseSymbol::Dash => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '.' | '·' | '•' => Some(MorseSymbol::Dot),
            '-' | '_' | '–' => Some(MorseSymbol::Dash),
            _ => None,
        }
    }
}

/// Silence between symbols, characters or words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MorseGap {
    Intra,
    Inter,
    Word,
}

impl MorseGap {
    pub const ALL: [MorseGap; 3] = [MorseGap::Intra, MorseGap::Inter, MorseGap::Word];

    pub fn units(self) -> u32 {
        match self {
            MorseGap::Intra => 1,
            MorseGap::Inter => 3,
            MorseGap::Word => 7,
        }
    }
}

/// An ordered dot/dash sequence for one character.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(Vec<MorseSymbol>);

impl Pattern {
    pub fn new(symbols: Vec<MorseSymbol>) -> Self {
        Self(symbols)
    }

    /// Parse `".-"`-style notation. Whitespace is ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        raw.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| MorseSymbol::from_char(c).ok_or_else(|| CadenceError::InvalidPattern(raw.into())))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn symbols(&self) -> &[MorseSymbol] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, symbol: MorseSymbol) {
        self.0.push(symbol);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// `true` if `self` is a prefix of `other`.
    pub fn is_prefix_of(&self, other: &Pattern) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Total keyed length in units including the 1-unit intra gaps.
    pub fn units(&self) -> u32 {
        let tones: u32 = self.0.iter().map(|s| s.units()).sum();
        tones + (self.0.len().saturating_sub(1) as u32) * MorseGap::Intra.units()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.0 {
            write!(f, "{}", s.as_char())?;
        }
        Ok(())
    }
}

impl From<Vec<MorseSymbol>> for Pattern {
    fn from(symbols: Vec<MorseSymbol>) -> Self {
        Self(symbols)
    }
}

impl<'a> IntoIterator for &'a Pattern {
    type Item = &'a MorseSymbol;
    type IntoIter = std::slice::Iter<'a, MorseSymbol>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Canonical durations derived from one unit.
///
/// Built fresh from the current settings at each session boundary; nothing
/// downstream caches the unit on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingModel {
    unit_ms: f64,
}

impl TimingModel {
    pub fn from_wpm(wpm: f64) -> Self {
        Self {
            unit_ms: unit_ms_from_wpm(wpm),
        }
    }

    pub fn from_unit_ms(unit_ms: f64) -> Self {
        let unit_ms = if unit_ms.is_finite() {
            unit_ms.max(MIN_UNIT_MS)
        } else {
            unit_ms_from_wpm(DEFAULT_WPM)
        };
        Self { unit_ms }
    }

    pub fn unit_ms(&self) -> f64 {
        self.unit_ms
    }

    pub fn dot_ms(&self) -> f64 {
        self.unit_ms
    }

    pub fn dash_ms(&self) -> f64 {
        self.unit_ms * 3.0
    }

    pub fn symbol_ms(&self, symbol: MorseSymbol) -> f64 {
        self.unit_ms * symbol.units() as f64
    }

    pub fn gap_ms(&self, gap: MorseGap) -> f64 {
        self.unit_ms * gap.units() as f64
    }

    pub fn wpm(&self) -> f64 {
        estimate_wpm_from_unit(self.unit_ms)
    }

    /// Time from the first tone onset to the end of the last tone.
    pub fn pattern_ms(&self, pattern: &Pattern) -> f64 {
        self.unit_ms * pattern.units() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_duration_at_common_speeds() {
        assert!((unit_ms_from_wpm(12.0) - 100.0).abs() < 1e-9);
        assert!((unit_ms_from_wpm(20.0) - 60.0).abs() < 1e-9);
        assert!((unit_ms_from_wpm(25.0) - 48.0).abs() < 1e-9);
    }

    #[test]
    fn unit_duration_is_clamped() {
        assert_eq!(unit_ms_from_wpm(500.0), MIN_UNIT_MS);
        assert_eq!(unit_ms_from_wpm(0.0), unit_ms_from_wpm(DEFAULT_WPM));
        assert_eq!(unit_ms_from_wpm(f64::NAN), unit_ms_from_wpm(DEFAULT_WPM));
    }

    #[test]
    fn canonical_multiples() {
        let model = TimingModel::from_wpm(20.0);
        assert!((model.dash_ms() - model.dot_ms() * 3.0).abs() < 1e-9);
        assert!((model.gap_ms(MorseGap::Intra) - 60.0).abs() < 1e-9);
        assert!((model.gap_ms(MorseGap::Inter) - 180.0).abs() < 1e-9);
        assert!((model.gap_ms(MorseGap::Word) - 420.0).abs() < 1e-9);
        assert!((model.wpm() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_parse_and_display() {
        let k = Pattern::parse("-.-").expect("valid pattern");
        assert_eq!(
            k.symbols(),
            &[MorseSymbol::Dash, MorseSymbol::Dot, MorseSymbol::Dash]
        );
        assert_eq!(k.to_string(), "-.-");
        // dash + gap + dot + gap + dash = 3 + 1 + 1 + 1 + 3
        assert_eq!(k.units(), 9);
        assert!(Pattern::parse(".x-").is_err());
    }

    #[test]
    fn prefix_check() {
        let k = Pattern::parse("-.-").unwrap();
        assert!(Pattern::parse("-.").unwrap().is_prefix_of(&k));
        assert!(!Pattern::parse("-..").unwrap().is_prefix_of(&k));
        assert!(Pattern::default().is_prefix_of(&k));
    }
}
