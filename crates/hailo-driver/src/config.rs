//! Configuration parameters
//!
//! Plain structs with defaults and builder-style setters. A
//! [`ConfigureParams`] is handed to the resources manager once per network
//! group; networks missing from it get [`NetworkParams::default`].

use hailo_chip::vdma::PENDING_BUFFERS_SIZE;
use std::collections::BTreeMap;
use std::time::Duration;

/// Boundary descriptor lists hold at least this many batches in flight
pub const MIN_ACTIVE_TRANSFERS_SCALE: u16 = 2;

/// ...and at most this many
pub const MAX_ACTIVE_TRANSFERS_SCALE: u16 = 4;

/// Largest batch a network may be configured with
#[allow(clippy::cast_possible_truncation)]
pub const MAX_BATCH_SIZE: u16 = (PENDING_BUFFERS_SIZE as u16 / MIN_ACTIVE_TRANSFERS_SCALE) - 1;

/// Batch size value meaning "use the default"
pub const DEFAULT_BATCH_SIZE: u16 = 0;

/// Batch size the default resolves to
pub const DEFAULT_ACTUAL_BATCH_SIZE: u16 = 1;

/// Default stream timeout (ms)
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 10_000;

/// Device power profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PowerMode {
    /// Favour throughput
    #[default]
    Performance,
    /// Favour power draw
    UltraPerformance,
}

/// Latency measurement flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LatencyMeasurement {
    /// No measurement
    #[default]
    None,
    /// Measure frame latency from interrupt timestamps
    Measure,
}

impl LatencyMeasurement {
    /// Whether timestamps are collected
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Measure)
    }
}

/// Per-network parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParams {
    /// Frames per batch; [`DEFAULT_BATCH_SIZE`] selects the default
    pub batch_size: u16,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl NetworkParams {
    /// Set the batch size
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u16) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Batch size with the default resolved
    pub const fn actual_batch_size(&self) -> u16 {
        if self.batch_size == DEFAULT_BATCH_SIZE {
            DEFAULT_ACTUAL_BATCH_SIZE
        } else {
            self.batch_size
        }
    }
}

/// Per-stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Blocking read/write timeout (ms)
    pub timeout_ms: u64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
        }
    }
}

impl StreamParams {
    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Timeout as a duration
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Network-group configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureParams {
    /// Power profile
    pub power_mode: PowerMode,

    /// Latency measurement
    pub latency: LatencyMeasurement,

    /// Per-network parameters, keyed by full network name
    pub network_params_by_name: BTreeMap<String, NetworkParams>,

    /// Per-stream parameters, keyed by stream name
    pub stream_params_by_name: BTreeMap<String, StreamParams>,
}

impl ConfigureParams {
    /// Set the power mode
    #[must_use]
    pub const fn with_power_mode(mut self, power_mode: PowerMode) -> Self {
        self.power_mode = power_mode;
        self
    }

    /// Set latency measurement
    #[must_use]
    pub const fn with_latency(mut self, latency: LatencyMeasurement) -> Self {
        self.latency = latency;
        self
    }

    /// Set one network's parameters
    #[must_use]
    pub fn with_network(mut self, name: impl Into<String>, params: NetworkParams) -> Self {
        self.network_params_by_name.insert(name.into(), params);
        self
    }

    /// Set one stream's parameters
    #[must_use]
    pub fn with_stream(mut self, name: impl Into<String>, params: StreamParams) -> Self {
        self.stream_params_by_name.insert(name.into(), params);
        self
    }

    /// Parameters of a stream, defaults when not set
    pub fn stream_params(&self, name: &str) -> StreamParams {
        self.stream_params_by_name.get(name).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_batch_resolves_to_one() {
        assert_eq!(NetworkParams::default().actual_batch_size(), 1);
        assert_eq!(NetworkParams::default().with_batch_size(8).actual_batch_size(), 8);
        assert_eq!(MAX_BATCH_SIZE, 63);
    }

    #[test]
    fn test_stream_params_fall_back_to_default() {
        let params = ConfigureParams::default()
            .with_stream("in", StreamParams::default().with_timeout(Duration::from_millis(250)));
        assert_eq!(params.stream_params("in").timeout(), Duration::from_millis(250));
        assert_eq!(params.stream_params("other").timeout(), Duration::from_secs(10));
    }
}
