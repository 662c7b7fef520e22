//! Frame latency from interrupt timestamps
//!
//! Input channels report when the first descriptor of a frame is processed
//! (start), output channels when the last one is (end). A frame's latency is
//! the latest end over all outputs minus its start; samples pair up FIFO.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Unmatched samples kept per queue; the oldest is dropped beyond this
pub const MAX_PENDING_SAMPLES: usize = 512;

/// Pairs start/end samples of one network
#[derive(Debug)]
pub struct LatencyMeter {
    inner: Mutex<Samples>,
}

#[derive(Debug, Default)]
struct Samples {
    starts: VecDeque<Duration>,
    ends: HashMap<String, VecDeque<Duration>>,
    total: Duration,
    count: u32,
}

impl LatencyMeter {
    /// Meter over the given output streams
    pub fn new<I, S>(output_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ends = output_names
            .into_iter()
            .map(|name| (name.into(), VecDeque::new()))
            .collect();
        Self {
            inner: Mutex::new(Samples {
                ends,
                ..Samples::default()
            }),
        }
    }

    /// Record a frame start
    pub fn add_start_sample(&self, timestamp: Duration) {
        let mut samples = self.inner.lock();
        push_bounded(&mut samples.starts, timestamp, "start");
        samples.update();
    }

    /// Record a frame end on `output`; unknown outputs are ignored
    pub fn add_end_sample(&self, output: &str, timestamp: Duration) {
        let mut samples = self.inner.lock();
        let Some(queue) = samples.ends.get_mut(output) else {
            tracing::warn!("Latency end sample for unknown output {output}");
            return;
        };
        push_bounded(queue, timestamp, output);
        samples.update();
    }

    /// Mean latency of the completed frames, `None` before the first one
    pub fn get_latency(&self, clear: bool) -> Option<Duration> {
        let mut samples = self.inner.lock();
        if samples.count == 0 {
            return None;
        }
        let mean = samples.total / samples.count;
        if clear {
            samples.total = Duration::ZERO;
            samples.count = 0;
        }
        Some(mean)
    }
}

fn push_bounded(queue: &mut VecDeque<Duration>, timestamp: Duration, label: &str) {
    if queue.len() >= MAX_PENDING_SAMPLES {
        queue.pop_front();
        tracing::debug!("Latency queue {label} full, dropped oldest sample");
    }
    queue.push_back(timestamp);
}

impl Samples {
    fn update(&mut self) {
        while !self.starts.is_empty()
            && !self.ends.is_empty()
            && self.ends.values().all(|queue| !queue.is_empty())
        {
            let Some(start) = self.starts.pop_front() else {
                break;
            };
            let end = self
                .ends
                .values_mut()
                .filter_map(VecDeque::pop_front)
                .max()
                .unwrap_or(start);
            self.total += end.saturating_sub(start);
            self.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_fifo_over_all_outputs() {
        let meter = LatencyMeter::new(["out0", "out1"]);
        meter.add_start_sample(Duration::from_micros(100));
        meter.add_start_sample(Duration::from_micros(200));
        meter.add_end_sample("out0", Duration::from_micros(150));
        assert_eq!(meter.get_latency(false), None);

        meter.add_end_sample("out1", Duration::from_micros(180));
        assert_eq!(meter.get_latency(false), Some(Duration::from_micros(80)));

        meter.add_end_sample("out0", Duration::from_micros(260));
        meter.add_end_sample("out1", Duration::from_micros(240));
        // (80 + 60) / 2
        assert_eq!(meter.get_latency(true), Some(Duration::from_micros(70)));
        assert_eq!(meter.get_latency(false), None);
    }

    #[test]
    fn test_unmatched_starts_are_bounded() {
        let meter = LatencyMeter::new(["out"]);
        for i in 0..=MAX_PENDING_SAMPLES as u64 {
            meter.add_start_sample(Duration::from_micros(i * 10));
        }
        assert_eq!(meter.inner.lock().starts.len(), MAX_PENDING_SAMPLES);

        // The start at 0 was dropped, so the end pairs with the one at 10
        meter.add_end_sample("out", Duration::from_micros(10_000));
        assert_eq!(meter.get_latency(false), Some(Duration::from_micros(9_990)));
        assert_eq!(meter.inner.lock().starts.len(), MAX_PENDING_SAMPLES - 1);
    }

    #[test]
    fn test_unmatched_ends_are_bounded() {
        let meter = LatencyMeter::new(["out0", "out1"]);
        for i in 0..MAX_PENDING_SAMPLES as u64 + 8 {
            meter.add_end_sample("out0", Duration::from_micros(i));
        }
        assert_eq!(meter.inner.lock().ends["out0"].len(), MAX_PENDING_SAMPLES);
        assert_eq!(meter.inner.lock().ends["out0"].front(), Some(&Duration::from_micros(8)));
    }
}
