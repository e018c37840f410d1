//! Backend selection and the owning `ToneOutput`.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::diagnostics::LatencyStore;
use crate::error::{CadenceError, Result};
use crate::output::OutputChannel;
use crate::tone::{
    BackendKind, BackendProbe, BackendReport, ProbeContext, TonePlan, ToneController, VirtualProbe,
};

/// Ordered list of probes. The first one that yields a controller wins.
pub struct BackendChain {
    probes: Vec<Box<dyn BackendProbe>>,
}

impl BackendChain {
    pub fn new(probes: Vec<Box<dyn BackendProbe>>) -> Self {
        Self { probes }
    }

    /// Low-latency native, then default-buffer native, then virtual.
    #[cfg(feature = "audio-cpal")]
    pub fn standard() -> Self {
        use crate::tone::{LowLatencyProbe, StreamProbe};
        Self::new(vec![
            Box::new(LowLatencyProbe),
            Box::new(StreamProbe),
            Box::new(VirtualProbe),
        ])
    }

    /// Without the `audio-cpal` feature only the virtual backend exists.
    #[cfg(not(feature = "audio-cpal"))]
    pub fn standard() -> Self {
        Self::virtual_only()
    }

    pub fn virtual_only() -> Self {
        Self::new(vec![Box::new(VirtualProbe)])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    pub fn select(&self, ctx: &ProbeContext) -> Option<Box<dyn ToneController>> {
        for probe in &self.probes {
            match probe.probe(ctx) {
                Some(controller) => {
                    info!(backend = probe.name(), "tone backend selected");
                    return Some(controller);
                }
                None => debug!(backend = probe.name(), "tone backend unavailable"),
            }
        }
        warn!("no tone backend available");
        None
    }
}

impl Default for BackendChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for BackendChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendChain")
            .field("probes", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Ready(BackendKind),
    Unavailable,
}

/// Owns the single active tone controller of an output session.
///
/// The chain is evaluated once in `new` and the result kept until
/// `rebuild`. Operational failures never surface as errors: they are
/// logged, counted in diagnostics, flag the output for re-evaluation and
/// turn the call into a no-op. The only error is `ChannelUnavailable`.
pub struct ToneOutput {
    chain: Arc<BackendChain>,
    ctx: ProbeContext,
    diagnostics: Arc<LatencyStore>,
    controller: Option<Box<dyn ToneController>>,
    needs_reevaluation: bool,
}

impl ToneOutput {
    pub fn new(chain: Arc<BackendChain>, ctx: ProbeContext, diagnostics: Arc<LatencyStore>) -> Self {
        let controller = chain.select(&ctx);
        Self {
            chain,
            ctx,
            diagnostics,
            controller,
            needs_reevaluation: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        match &self.controller {
            Some(c) => ChannelState::Ready(c.kind()),
            None => ChannelState::Unavailable,
        }
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.controller.as_ref().map(|c| c.kind())
    }

    /// Set after a backend failure; the next `rebuild` re-runs the chain.
    pub fn needs_reevaluation(&self) -> bool {
        self.needs_reevaluation
    }

    /// Frequency and gain used by the next `rebuild`.
    pub fn set_probe_params(&mut self, hz: f32, gain: f32) {
        self.ctx.hz = hz;
        self.ctx.gain = gain;
    }

    /// Tear down the active controller, then evaluate the chain again.
    pub fn rebuild(&mut self) -> ChannelState {
        self.teardown();
        self.controller = self.chain.select(&self.ctx);
        self.needs_reevaluation = false;
        self.state()
    }

    pub fn prepare(&mut self, hz: f32) -> Result<()> {
        self.run("prepare", |c| c.prepare(hz))
    }

    pub fn start(&mut self, hz: Option<f32>) -> Result<()> {
        self.run("start", |c| c.start(hz))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.run("stop", |c| c.stop())
    }

    pub fn set_volume(&mut self, gain: f32) -> Result<()> {
        self.ctx.gain = gain;
        self.run("set_volume", |c| c.set_volume(gain))
    }

    /// `Ok(None)` when the backend cannot sequence or failed trying.
    pub fn sequence(&mut self, plan: &TonePlan) -> Result<Option<Receiver<BackendReport>>> {
        self.run("sequence", |c| c.sequence(plan))
    }

    pub fn cancel_sequence(&mut self) -> Result<()> {
        self.run("cancel_sequence", |c| c.cancel_sequence())
    }

    pub fn current_hz(&self) -> Option<f32> {
        self.controller.as_ref().and_then(|c| c.current_hz())
    }

    /// Release the controller. Idempotent; later calls report
    /// `ChannelUnavailable` until `rebuild`.
    pub fn teardown(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.teardown();
            debug!(backend = controller.kind().as_str(), "tone output torn down");
        }
    }

    fn run<R: Default>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut dyn ToneController) -> Result<R>,
    ) -> Result<R> {
        let controller = self
            .controller
            .as_mut()
            .ok_or(CadenceError::ChannelUnavailable(OutputChannel::Audio))?;
        match f(controller.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) => {
                let backend = controller.kind();
                warn!(backend = backend.as_str(), op, "tone backend failure: {e}");
                self.diagnostics
                    .record_failure(OutputChannel::Audio, format!("{backend} {op}: {e}"));
                self.needs_reevaluation = true;
                Ok(R::default())
            }
        }
    }
}

impl Drop for ToneOutput {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for ToneOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToneOutput")
            .field("state", &self.state())
            .field("needs_reevaluation", &self.needs_reevaluation)
            .finish_non_exhaustive()
    }
}
