//! Silent fallback backend.
//!
//! Always available. Tracks key state and timestamps so the rest of the
//! engine behaves identically on hosts without an audio device.

use tracing::debug;

use crate::clock::SharedClock;
use crate::error::{CadenceError, Result};
use crate::tone::{BackendKind, BackendProbe, ProbeContext, ToneController};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualKeyEvent {
    pub key_down: bool,
    pub hz: f32,
    pub at_ms: f64,
}

pub struct VirtualTone {
    clock: SharedClock,
    hz: Option<f32>,
    gain: f32,
    key_down: bool,
    torn_down: bool,
    last_event: Option<VirtualKeyEvent>,
}

impl VirtualTone {
    pub fn new(clock: SharedClock, gain: f32) -> Self {
        Self {
            clock,
            hz: None,
            gain,
            key_down: false,
            torn_down: false,
            last_event: None,
        }
    }

    pub fn is_key_down(&self) -> bool {
        self.key_down
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn last_event(&self) -> Option<VirtualKeyEvent> {
        self.last_event
    }

    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(CadenceError::backend(
                BackendKind::Virtual.as_str(),
                "controller was torn down",
            ));
        }
        Ok(())
    }
}

impl ToneController for VirtualTone {
    fn kind(&self) -> BackendKind {
        BackendKind::Virtual
    }

    fn prepare(&mut self, hz: f32) -> Result<()> {
        self.ensure_live()?;
        self.hz = Some(hz);
        Ok(())
    }

    fn start(&mut self, hz: Option<f32>) -> Result<()> {
        self.ensure_live()?;
        if let Some(hz) = hz {
            self.hz = Some(hz);
        }
        self.key_down = true;
        self.last_event = Some(VirtualKeyEvent {
            key_down: true,
            hz: self.hz.unwrap_or_default(),
            at_ms: self.clock.now_ms(),
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.key_down = false;
        self.last_event = Some(VirtualKeyEvent {
            key_down: false,
            hz: self.hz.unwrap_or_default(),
            at_ms: self.clock.now_ms(),
        });
        Ok(())
    }

    fn teardown(&mut self) {
        if !self.torn_down {
            debug!("virtual tone torn down");
        }
        self.key_down = false;
        self.torn_down = true;
    }

    fn current_hz(&self) -> Option<f32> {
        self.hz
    }

    fn set_volume(&mut self, gain: f32) -> Result<()> {
        self.gain = gain.clamp(0.0, 1.0);
        Ok(())
    }
}

/// Last link of the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualProbe;

impl BackendProbe for VirtualProbe {
    fn name(&self) -> &'static str {
        BackendKind::Virtual.as_str()
    }

    fn probe(&self, ctx: &ProbeContext) -> Option<Box<dyn ToneController>> {
        Some(Box::new(VirtualTone::new(ctx.clock.clone(), ctx.gain)))
    }
}
