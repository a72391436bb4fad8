//! Validated configuration for streaming, processes and tracking.
//!
//! Every tunable is a `nutype` newtype checked at construction, so an invalid
//! configuration cannot reach the runtime. All structs implement `Serialize`
//! and `Deserialize` for hosts that load them from their own config files.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of events a streamer prefetches per store read.
///
/// Validated to be between 1 and 10 000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Number of processed events after which a driver persists its checkpoint.
///
/// Must be at least 1.
#[nutype(
    validate(greater_or_equal = 1),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct FlushThreshold(u64);

/// Delay before a running process retries a failed store read, in milliseconds.
///
/// Validated to be between 10ms and 10 minutes.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    default = 1_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct ErrorRetryDelayMs(u64);

impl ErrorRetryDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// How long a committed tracker stays queryable, in seconds.
///
/// Validated to be between 1 second and 24 hours.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 86_400),
    default = 300,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct TrackerRetentionSecs(u64);

impl TrackerRetentionSecs {
    /// Convert to Duration for expiry checks.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into())
    }
}

/// Configuration shared by every streamer created from one `EventStreaming`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Events fetched per store read.
    pub batch_size: BatchSize,
}

impl StreamingConfig {
    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Configuration of a process driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Processed events between checkpoints.
    pub flush_threshold: FlushThreshold,
    /// Back-off after a failed store read.
    pub error_retry_delay: ErrorRetryDelayMs,
}

impl ProcessConfig {
    /// Sets the checkpoint interval.
    #[must_use]
    pub fn with_flush_threshold(mut self, flush_threshold: FlushThreshold) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    /// Sets the store error back-off.
    #[must_use]
    pub fn with_error_retry_delay(mut self, error_retry_delay: ErrorRetryDelayMs) -> Self {
        self.error_retry_delay = error_retry_delay;
        self
    }
}

/// Configuration of the event process tracking coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// How long committed trackers are kept.
    pub retention: TrackerRetentionSecs,
}

impl TrackingConfig {
    /// Sets the tracker retention.
    #[must_use]
    pub fn with_retention(mut self, retention: TrackerRetentionSecs) -> Self {
        self.retention = retention;
        self
    }
}
