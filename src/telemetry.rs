//! Push-model telemetry types.
//!
//! The subsystem folds counters locally and periodically pushes a batch of
//! metrics through a [`TelemetryPublisher`]. Transport is somebody else's
//! problem; this module only defines the value model and the interval
//! ticker that gates publication.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

// =============================================================================
// Metric names
// =============================================================================

pub const METRIC_FREE_MPIO_COUNT: &str = "meta_pump_free_mpio_count";
pub const METRIC_WRITE_TYPE_COUNT: &str = "meta_pump_write_type_count";
pub const METRIC_DONE_COUNT_STORAGE: &str = "meta_pump_done_count_storage";
pub const METRIC_TOTAL_IO_COUNT: &str = "meta_pump_total_io_count";
pub const METRIC_DONE_COUNT_FILE_TYPE: &str = "meta_pump_done_count_file_type";
pub const METRIC_TIME_ALL_STAGES_MS: &str = "meta_pump_time_allocate_to_release_ms";
pub const METRIC_TIME_WRITE_TO_RELEASE_MS: &str = "meta_pump_time_write_to_release_ms";
pub const METRIC_TIME_PUSH_TO_POP_MS: &str = "meta_pump_time_push_to_pop_ms";
pub const METRIC_SAMPLED_MPIO_COUNT: &str = "meta_pump_sampled_mpio_count";

// =============================================================================
// Value model
// =============================================================================

/// Kind of a published metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// One metric sample: name, kind, value and labels.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: u64,
    pub labels: Vec<(&'static str, String)>,
}

impl Metric {
    pub fn gauge(name: &'static str, value: u64) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            value,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.push((key, value.into()));
        self
    }

    /// Returns the value of `key`, if labeled.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink for metric batches.
pub trait TelemetryPublisher: Send + Sync {
    fn publish_metric_list(&self, metrics: Vec<Metric>);
}

// =============================================================================
// Interval ticker
// =============================================================================

/// Gates an action to at most once per period.
///
/// The first call to `check_interval` after construction reports `false`;
/// the ticker fires once the configured period has elapsed since the last
/// firing.
#[derive(Debug)]
pub struct TimeInterval {
    period: Duration,
    last: Mutex<Instant>,
}

impl TimeInterval {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::new(Instant::now()),
        }
    }

    /// Returns true (and rearms) if the period has elapsed.
    pub fn check_interval(&self) -> bool {
        let mut last = self.last.lock();
        if last.elapsed() >= self.period {
            *last = Instant::now();
            true
        } else {
            false
        }
    }
}
