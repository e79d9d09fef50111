//! # Playback Configuration
//!
//! Tuning knobs for the decode pipeline: buffer sizes, probe window, read
//! timeouts, retry budget and safety limits.

use bridge_traits::http::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for `probe_bytes`.
pub const MAX_PROBE_BYTES: usize = 64 * 1024;

/// Pipeline configuration.
///
/// Durations are stored as milliseconds so the struct round-trips through
/// JSON host configuration unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Capacity of the frame buffer, measured in decoded audio time.
    ///
    /// Default: 2000 ms.
    #[serde(default = "default_buffer_duration_ms")]
    pub buffer_duration_ms: u64,

    /// Bytes inspected by the container prober.
    ///
    /// Default: 8 KiB. Maximum: 64 KiB.
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: usize,

    /// Size of the stream read-ahead buffer.
    ///
    /// Default: 64 KiB.
    #[serde(default = "default_read_ahead_bytes")]
    pub read_ahead_bytes: usize,

    /// Maximum time a single remote read may block.
    ///
    /// Default: 10 seconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Retry budget for transient transport failures.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Slice used by blocking waits between cancellation checks.
    ///
    /// Default: 50 ms.
    #[serde(default = "default_poll_slice_ms")]
    pub poll_slice_ms: u64,

    /// Consecutive recoverable packet errors tolerated before the track fails.
    ///
    /// Default: 32.
    #[serde(default = "default_max_consecutive_packet_errors")]
    pub max_consecutive_packet_errors: u32,

    /// Largest single buffer a demuxer may allocate from a size field.
    ///
    /// Default: 16 MiB.
    #[serde(default = "default_max_allocation_bytes")]
    pub max_allocation_bytes: u64,
}

/// Retry budget for transient read failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts per read, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySettings {
    /// Converts to the bridge-level retry policy (exponential backoff).
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            use_exponential_backoff: true,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_duration_ms: default_buffer_duration_ms(),
            probe_bytes: default_probe_bytes(),
            read_ahead_bytes: default_read_ahead_bytes(),
            read_timeout_ms: default_read_timeout_ms(),
            retry: RetrySettings::default(),
            poll_slice_ms: default_poll_slice_ms(),
            max_consecutive_packet_errors: default_max_consecutive_packet_errors(),
            max_allocation_bytes: default_max_allocation_bytes(),
        }
    }
}

impl PlaybackConfig {
    /// Create a configuration optimized for low latency.
    ///
    /// - Smaller buffer (500 ms)
    /// - Shorter read timeout and retry delays
    pub fn low_latency() -> Self {
        Self {
            buffer_duration_ms: 500,
            read_ahead_bytes: 16 * 1024,
            read_timeout_ms: 5_000,
            retry: RetrySettings {
                max_attempts: 2,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            },
            poll_slice_ms: 20,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for stability over slow links.
    ///
    /// - Larger buffer (5 s)
    /// - More patient retries
    pub fn high_quality() -> Self {
        Self {
            buffer_duration_ms: 5_000,
            read_ahead_bytes: 256 * 1024,
            read_timeout_ms: 20_000,
            retry: RetrySettings {
                max_attempts: 5,
                base_delay_ms: 500,
                max_delay_ms: 10_000,
            },
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_duration_ms == 0 {
            return Err("buffer_duration_ms must be > 0".to_string());
        }

        if self.probe_bytes == 0 || self.probe_bytes > MAX_PROBE_BYTES {
            return Err(format!(
                "probe_bytes must be between 1 and {}",
                MAX_PROBE_BYTES
            ));
        }

        if self.read_ahead_bytes == 0 {
            return Err("read_ahead_bytes must be > 0".to_string());
        }

        if self.read_timeout_ms == 0 {
            return Err("read_timeout_ms must be > 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be >= 1".to_string());
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms cannot exceed retry.max_delay_ms".to_string());
        }

        if self.poll_slice_ms == 0 {
            return Err("poll_slice_ms must be > 0".to_string());
        }

        if self.max_allocation_bytes < 64 * 1024 {
            return Err("max_allocation_bytes must be at least 64 KiB".to_string());
        }

        Ok(())
    }

    pub fn buffer_duration(&self) -> Duration {
        Duration::from_millis(self.buffer_duration_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }
}

// ============================================================================
// Default Functions (for serde)
// ============================================================================

fn default_buffer_duration_ms() -> u64 {
    2_000
}

fn default_probe_bytes() -> usize {
    8 * 1024
}

fn default_read_ahead_bytes() -> usize {
    64 * 1024
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_poll_slice_ms() -> u64 {
    50
}

fn default_max_consecutive_packet_errors() -> u32 {
    32
}

fn default_max_allocation_bytes() -> u64 {
    16 * 1024 * 1024
}

// ============================================================================
// Track Statistics
// ============================================================================

/// Counters maintained by the track executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackStats {
    /// Packets read from the demuxer.
    pub packets_read: u64,
    /// Frames pushed into the frame buffer.
    pub frames_produced: u64,
    /// Samples per channel decoded.
    pub samples_decoded: u64,
    /// Recoverable errors skipped.
    pub recovered_errors: u32,
    /// Completed seeks.
    pub seeks: u32,
    /// Average decode time per packet in milliseconds.
    pub avg_decode_time_ms: f64,
}
