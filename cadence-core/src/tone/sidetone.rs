//! Sample-domain tone generation used inside the native audio callback.
//!
//! Nothing here allocates or locks once constructed, so both types can run
//! on the real-time audio thread.

use std::f32::consts::TAU;

use crate::tone::TonePlan;

/// Rise/fall time of the keying envelope. Hard keying clicks audibly.
const ENVELOPE_MS: f32 = 5.0;

/// Sine oscillator with a linear attack/decay envelope.
pub struct SidetoneGenerator {
    phase: f32,
    phase_increment: f32,
    sample_rate: f32,
    frequency: f32,
    gain: f32,
    envelope: f32,
    envelope_step: f32,
}

impl SidetoneGenerator {
    pub fn new(frequency: f32, gain: f32, sample_rate: f32) -> Self {
        let sample_rate = sample_rate.max(1.0);
        Self {
            phase: 0.0,
            phase_increment: TAU * frequency / sample_rate,
            sample_rate,
            frequency,
            gain: gain.clamp(0.0, 1.0),
            envelope: 0.0,
            envelope_step: 1000.0 / (ENVELOPE_MS * sample_rate),
        }
    }

    pub fn next_sample(&mut self, key_down: bool) -> f32 {
        self.envelope = if key_down {
            (self.envelope + self.envelope_step).min(1.0)
        } else {
            (self.envelope - self.envelope_step).max(0.0)
        };

        if self.envelope == 0.0 {
            // Restart at a zero crossing so the next attack is click-free.
            self.phase = 0.0;
            return 0.0;
        }

        let sample = self.phase.sin() * self.envelope * self.gain;
        self.phase += self.phase_increment;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        sample
    }

    pub fn set_frequency(&mut self, frequency: f32) {
        if frequency != self.frequency {
            self.frequency = frequency;
            self.phase_increment = TAU * frequency / self.sample_rate;
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    pub fn is_silent(&self) -> bool {
        self.envelope == 0.0
    }
}

/// Event raised by `PlanCursor` while stepping through a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorEvent {
    /// Segment `sequence` starts `lead` samples from now.
    Announce { sequence: u32, start_sample: u64 },
    /// Segment `sequence` starts on this sample.
    Start { sequence: u32, start_sample: u64, length: u64 },
}

#[derive(Debug, Clone, Copy)]
struct SampleSegment {
    sequence: u32,
    start: u64,
    end: u64,
}

/// Walks a `TonePlan` one sample at a time, deciding key state and raising
/// announce/start events at exact sample positions.
#[derive(Debug, Clone)]
pub struct PlanCursor {
    segments: Vec<SampleSegment>,
    lead: u64,
    position: u64,
    next_announce: usize,
    next_start: usize,
    current: usize,
}

impl PlanCursor {
    pub fn new(plan: &TonePlan, sample_rate: f32) -> Self {
        let per_ms = f64::from(sample_rate) / 1000.0;
        let to_samples = |ms: f64| (ms.max(0.0) * per_ms).round() as u64;
        let segments = plan
            .symbols
            .iter()
            .map(|s| {
                let start = to_samples(s.offset_ms);
                SampleSegment {
                    sequence: s.sequence,
                    start,
                    end: start + to_samples(s.duration_ms).max(1),
                }
            })
            .collect();
        Self {
            segments,
            lead: to_samples(plan.lead_ms),
            position: 0,
            next_announce: 0,
            next_start: 0,
            current: 0,
        }
    }

    /// Samples rendered so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        self.segments
            .last()
            .map_or(true, |last| self.position >= last.end)
    }

    /// Advance one sample. Returns the key state for that sample.
    pub fn step(&mut self, mut on_event: impl FnMut(CursorEvent)) -> bool {
        let p = self.position;

        while let Some(seg) = self.segments.get(self.next_announce) {
            if seg.start > p + self.lead {
                break;
            }
            on_event(CursorEvent::Announce {
                sequence: seg.sequence,
                start_sample: seg.start,
            });
            self.next_announce += 1;
        }

        while let Some(seg) = self.segments.get(self.next_start) {
            if seg.start > p {
                break;
            }
            on_event(CursorEvent::Start {
                sequence: seg.sequence,
                start_sample: seg.start,
                length: seg.end - seg.start,
            });
            self.next_start += 1;
        }

        while self
            .segments
            .get(self.current)
            .is_some_and(|seg| p >= seg.end)
        {
            self.current += 1;
        }

        self.position += 1;
        self.segments
            .get(self.current)
            .is_some_and(|seg| p >= seg.start && p < seg.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::Pattern;

    #[test]
    fn envelope_ramps_up_and_back_to_silence() {
        let sr = 48_000.0;
        let mut gen = SidetoneGenerator::new(600.0, 1.0, sr);
        let ramp = (ENVELOPE_MS / 1000.0 * sr) as usize;
        let peak = (0..ramp * 2)
            .map(|_| gen.next_sample(true).abs())
            .fold(0.0_f32, f32::max);
        assert!(peak > 0.9, "peak {peak}");
        for _ in 0..ramp + 1 {
            gen.next_sample(false);
        }
        assert!(gen.is_silent());
        assert_eq!(gen.next_sample(false), 0.0);
    }

    #[test]
    fn gain_scales_output() {
        let mut gen = SidetoneGenerator::new(600.0, 0.25, 48_000.0);
        let peak = (0..4_800)
            .map(|_| gen.next_sample(true).abs())
            .fold(0.0_f32, f32::max);
        assert!(peak <= 0.25 + 1e-6);
        assert!(peak > 0.2);
    }

    #[test]
    fn cursor_keys_exact_sample_ranges() {
        // 1 kHz sample rate: one sample per millisecond.
        let plan = TonePlan::from_pattern(&Pattern::parse(".-").unwrap(), 10.0, 600.0, 5.0);
        let mut cursor = PlanCursor::new(&plan, 1_000.0);
        let mut keyed = Vec::new();
        let mut events = Vec::new();
        while !cursor.is_finished() {
            keyed.push(cursor.step(|e| events.push(e)));
        }
        // dot 0..10, gap 10..20, dash 20..50
        assert_eq!(keyed.len(), 50);
        assert!(keyed[..10].iter().all(|&k| k));
        assert!(keyed[10..20].iter().all(|&k| !k));
        assert!(keyed[20..50].iter().all(|&k| k));

        let announces: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CursorEvent::Announce { sequence, start_sample } => Some((*sequence, *start_sample)),
                _ => None,
            })
            .collect();
        assert_eq!(announces, vec![(0, 0), (1, 20)]);
        let starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CursorEvent::Start { sequence, length, .. } => Some((*sequence, *length)),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![(0, 10), (1, 30)]);
    }

    #[test]
    fn announce_precedes_start_by_lead() {
        let plan = TonePlan::from_pattern(&Pattern::parse("..").unwrap(), 10.0, 600.0, 5.0);
        let mut cursor = PlanCursor::new(&plan, 1_000.0);
        let mut seen = Vec::new();
        while !cursor.is_finished() {
            let at = cursor.position();
            cursor.step(|e| seen.push((at, e)));
        }
        let second_announce = seen
            .iter()
            .find(|(_, e)| matches!(e, CursorEvent::Announce { sequence: 1, .. }))
            .map(|(at, _)| *at);
        let second_start = seen
            .iter()
            .find(|(_, e)| matches!(e, CursorEvent::Start { sequence: 1, .. }))
            .map(|(at, _)| *at);
        assert_eq!(second_announce, Some(15));
        assert_eq!(second_start, Some(20));
    }
}
