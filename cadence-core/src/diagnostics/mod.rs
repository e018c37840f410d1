//! Latency diagnostics store.
//!
//! One bounded ring buffer of `LatencySample`s per output channel, plus a
//! bounded log of timing anomalies reported by the scheduler. Appends evict
//! the oldest sample once a buffer is full. Writers take a short `RwLock`
//! write guard; snapshot readers never block each other.
//!
//! Nothing here touches the filesystem except `export_json`, which callers
//! run outside the symbol-timing path.

pub mod stats;

use std::fs;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::output::OutputChannel;

pub use stats::LatencyStats;

/// Samples kept per channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 200;

/// Timing anomalies kept for inspection.
pub const ANOMALY_CAPACITY: usize = 50;

/// One latency measurement: how long after its requested time a channel
/// actually acted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySample {
    pub latency_ms: f64,
    pub captured_at_ms: f64,
    pub requested_at_ms: Option<f64>,
    pub source: Option<String>,
    pub correlation_id: Option<String>,
    pub device_tag: String,
}

/// Scheduler-reported offset between requested and backend-observed timing
/// beyond the anomaly threshold. Playback continues regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingAnomaly {
    pub correlation_id: String,
    pub sequence: Option<u32>,
    pub offset_ms: f64,
    pub skew_ms: Option<f64>,
    pub captured_at_ms: f64,
}

/// Pull-based per-channel view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel: OutputChannel,
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub jitter_ms: f64,
    pub last_sample: Option<LatencySample>,
    pub failures: u64,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticsExport {
    version: u8,
    exported_at: chrono::DateTime<chrono::Utc>,
    device_tag: String,
    channels: Vec<ChannelSnapshot>,
    anomalies: Vec<TimingAnomaly>,
}

struct ChannelBuffer {
    samples: HeapRb<LatencySample>,
    failures: u64,
    last_failure: Option<String>,
}

impl ChannelBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            samples: HeapRb::new(capacity.max(1)),
            failures: 0,
            last_failure: None,
        }
    }
}

/// Rolling latency buffers for every output channel.
pub struct LatencyStore {
    clock: SharedClock,
    device_tag: String,
    capacity: usize,
    channels: [RwLock<ChannelBuffer>; OutputChannel::COUNT],
    anomalies: Mutex<HeapRb<TimingAnomaly>>,
}

impl LatencyStore {
    pub fn new(clock: SharedClock, device_tag: impl Into<String>) -> Self {
        Self::with_capacity(clock, device_tag, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(clock: SharedClock, device_tag: impl Into<String>, capacity: usize) -> Self {
        Self {
            clock,
            device_tag: device_tag.into(),
            capacity: capacity.max(1),
            channels: std::array::from_fn(|_| RwLock::new(ChannelBuffer::new(capacity))),
            anomalies: Mutex::new(HeapRb::new(ANOMALY_CAPACITY)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn device_tag(&self) -> &str {
        &self.device_tag
    }

    /// Record `now - requested_at_ms` for `channel`.
    pub fn record_since(
        &self,
        channel: OutputChannel,
        requested_at_ms: f64,
        source: Option<&str>,
        correlation_id: Option<&str>,
    ) -> f64 {
        let now = self.clock.now_ms();
        let latency_ms = (now - requested_at_ms).max(0.0);
        self.push(
            channel,
            LatencySample {
                latency_ms,
                captured_at_ms: now,
                requested_at_ms: Some(requested_at_ms),
                source: source.map(str::to_owned),
                correlation_id: correlation_id.map(str::to_owned),
                device_tag: self.device_tag.clone(),
            },
        );
        latency_ms
    }

    /// Record a pre-measured latency value.
    pub fn record(&self, channel: OutputChannel, latency_ms: f64) {
        let now = self.clock.now_ms();
        self.push(
            channel,
            LatencySample {
                latency_ms: latency_ms.max(0.0),
                captured_at_ms: now,
                requested_at_ms: None,
                source: None,
                correlation_id: None,
                device_tag: self.device_tag.clone(),
            },
        );
    }

    pub fn push(&self, channel: OutputChannel, sample: LatencySample) {
        if !sample.latency_ms.is_finite() {
            debug!(%channel, "dropping non-finite latency sample");
            return;
        }
        let mut buf = self.channels[channel.index()].write();
        buf.samples.push_overwrite(sample);
    }

    /// Count a channel failure. The channel's other samples are unaffected.
    pub fn record_failure(&self, channel: OutputChannel, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(%channel, detail = detail.as_str(), "output channel failure");
        let mut buf = self.channels[channel.index()].write();
        buf.failures = buf.failures.saturating_add(1);
        buf.last_failure = Some(detail);
    }

    pub fn record_anomaly(&self, anomaly: TimingAnomaly) {
        warn!(
            correlation_id = anomaly.correlation_id.as_str(),
            sequence = ?anomaly.sequence,
            offset_ms = format_args!("{:.1}", anomaly.offset_ms),
            "timing anomaly"
        );
        self.anomalies.lock().push_overwrite(anomaly);
    }

    pub fn anomalies(&self) -> Vec<TimingAnomaly> {
        self.anomalies.lock().iter().cloned().collect()
    }

    pub fn samples(&self, channel: OutputChannel) -> Vec<LatencySample> {
        self.channels[channel.index()]
            .read()
            .samples
            .iter()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, channel: OutputChannel) -> ChannelSnapshot {
        let buf = self.channels[channel.index()].read();
        let values: Vec<f64> = buf.samples.iter().map(|s| s.latency_ms).collect();
        let stats = LatencyStats::from_values(&values);
        ChannelSnapshot {
            channel,
            count: buf.samples.occupied_len(),
            mean_ms: stats.mean,
            p50_ms: stats.p50,
            p95_ms: stats.p95,
            jitter_ms: stats.jitter(),
            last_sample: buf.samples.iter().last().cloned(),
            failures: buf.failures,
            last_failure: buf.last_failure.clone(),
        }
    }

    pub fn snapshot_all(&self) -> Vec<ChannelSnapshot> {
        OutputChannel::ALL.iter().map(|&c| self.snapshot(c)).collect()
    }

    pub fn reset(&self) {
        for channel in &self.channels {
            let mut buf = channel.write();
            buf.samples.clear();
            buf.failures = 0;
            buf.last_failure = None;
        }
        self.anomalies.lock().clear();
    }

    /// Write a timestamped JSON bundle of all channels and anomalies.
    ///
    /// Blocking file I/O; keep it off the playback path.
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let bundle = DiagnosticsExport {
            version: 1,
            exported_at: chrono::Utc::now(),
            device_tag: self.device_tag.clone(),
            channels: self.snapshot_all(),
            anomalies: self.anomalies(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&bundle)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl std::fmt::Debug for LatencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyStore")
            .field("device_tag", &self.device_tag)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store(capacity: usize) -> (Arc<ManualClock>, LatencyStore) {
        let clock = Arc::new(ManualClock::new(0.0));
        let store = LatencyStore::with_capacity(clock.clone(), "test-device", capacity);
        (clock, store)
    }

    #[test]
    fn snapshot_of_five_samples() {
        let (_, store) = store(DEFAULT_CHANNEL_CAPACITY);
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            store.record(OutputChannel::Haptic, v);
        }
        let snap = store.snapshot(OutputChannel::Haptic);
        assert_eq!(snap.count, 5);
        assert!((snap.mean_ms - 30.0).abs() < 1e-9);
        assert!((snap.p50_ms - 30.0).abs() < 1e-9);
        assert!(snap.jitter_ms >= 0.0);
        assert!((snap.jitter_ms - (snap.p95_ms - snap.p50_ms)).abs() < 1e-9);
        assert_eq!(snap.last_sample.unwrap().latency_ms, 50.0);
    }

    #[test]
    fn buffer_evicts_oldest_first() {
        let (_, store) = store(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            store.record(OutputChannel::Flash, v);
        }
        let kept: Vec<f64> = store
            .samples(OutputChannel::Flash)
            .iter()
            .map(|s| s.latency_ms)
            .collect();
        assert_eq!(kept, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn record_since_uses_clock_and_tags() {
        let (clock, store) = store(8);
        clock.set_ms(112.0);
        let latency = store.record_since(OutputChannel::Torch, 100.0, Some("timer"), Some("pb-1"));
        assert!((latency - 12.0).abs() < 1e-9);
        let sample = store.snapshot(OutputChannel::Torch).last_sample.unwrap();
        assert_eq!(sample.source.as_deref(), Some("timer"));
        assert_eq!(sample.correlation_id.as_deref(), Some("pb-1"));
        assert_eq!(sample.device_tag, "test-device");
        assert_eq!(sample.requested_at_ms, Some(100.0));
    }

    #[test]
    fn channels_are_independent() {
        let (_, store) = store(8);
        store.record(OutputChannel::Audio, 5.0);
        store.record_failure(OutputChannel::Torch, "torch unsupported");
        assert_eq!(store.snapshot(OutputChannel::Audio).count, 1);
        assert_eq!(store.snapshot(OutputChannel::Haptic).count, 0);
        let torch = store.snapshot(OutputChannel::Torch);
        assert_eq!(torch.failures, 1);
        assert_eq!(torch.last_failure.as_deref(), Some("torch unsupported"));
    }

    #[test]
    fn empty_channel_snapshot_is_zeroed() {
        let (_, store) = store(8);
        let snap = store.snapshot(OutputChannel::Haptic);
        assert_eq!(snap.count, 0);
        assert_eq!(snap.mean_ms, 0.0);
        assert_eq!(snap.jitter_ms, 0.0);
        assert!(snap.last_sample.is_none());
    }

    #[test]
    fn reset_clears_samples_failures_and_anomalies() {
        let (_, store) = store(8);
        store.record(OutputChannel::Audio, 5.0);
        store.record_failure(OutputChannel::Audio, "boom");
        store.record_anomaly(TimingAnomaly {
            correlation_id: "pb-1".into(),
            sequence: Some(0),
            offset_ms: 120.0,
            skew_ms: None,
            captured_at_ms: 0.0,
        });
        store.reset();
        assert_eq!(store.snapshot(OutputChannel::Audio).count, 0);
        assert_eq!(store.snapshot(OutputChannel::Audio).failures, 0);
        assert!(store.anomalies().is_empty());
    }

    #[test]
    fn export_writes_camel_case_bundle() {
        let (_, store) = store(8);
        store.record(OutputChannel::Haptic, 7.0);
        let dir = std::env::temp_dir().join(format!("cadence-diag-{}", std::process::id()));
        let path = dir.join("latency.json");
        store.export_json(&path).expect("export diagnostics");
        let raw = fs::read_to_string(&path).expect("read export");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("parse export");
        assert_eq!(json["version"], 1);
        assert_eq!(json["deviceTag"], "test-device");
        assert_eq!(json["channels"].as_array().map(|a| a.len()), Some(4));
        let _ = fs::remove_dir_all(&dir);
    }
}
