//! Haptic pulse channel.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::timing::MorseSymbol;

/// Pulse strength requested from the platform vibrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HapticIntensity {
    Light,
    Medium,
    Heavy,
}

impl HapticIntensity {
    /// Dots tap lightly, dashes a little firmer.
    pub fn for_symbol(symbol: MorseSymbol) -> Self {
        match symbol {
            MorseSymbol::Dot => HapticIntensity::Light,
            MorseSymbol::Dash => HapticIntensity::Medium,
        }
    }
}

/// Platform vibrator. Implementations must return quickly; the pulse itself
/// runs on the device.
pub trait HapticDriver: Send + Sync + 'static {
    fn pulse(&self, intensity: HapticIntensity) -> Result<()>;
}

/// Driver for hosts without a vibrator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHaptics;

impl HapticDriver for NoopHaptics {
    fn pulse(&self, _intensity: HapticIntensity) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_is_light_and_dash_is_medium() {
        assert_eq!(HapticIntensity::for_symbol(MorseSymbol::Dot), HapticIntensity::Light);
        assert_eq!(HapticIntensity::for_symbol(MorseSymbol::Dash), HapticIntensity::Medium);
    }
}
