//! Timeout enforcement for the importer
//!
//! - `overall_seconds`: maximum wall-clock time for the event-stream phase
//! - `idle_event_seconds`: maximum time without a new line from the exporter
//! - `connect_timeout_seconds`: TCP/HTTP connection timeout (handled in the client)
//! - `fetch_timeout_seconds`: maximum time for the fetcher, 0 for unbounded
//!
//! The exporter pulls and saves before it says much, so the idle limit has
//! to cover the slowest single tool step, not just network stalls.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum wall-clock time for the event stream (default: 7200 = 2 h)
    pub overall_seconds: u64,

    /// Maximum time without a new event line (default: 1800 = 30 min)
    ///
    /// The exporter sends a progress line every minute while a pull or save
    /// runs, so only a stalled exporter or connection trips this.
    pub idle_event_seconds: u64,

    /// Connection timeout (default: 30)
    pub connect_timeout_seconds: u64,

    /// Fetcher timeout, 0 for unbounded (default: 0)
    pub fetch_timeout_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overall_seconds: 7200,
            idle_event_seconds: 1800,
            connect_timeout_seconds: 30,
            fetch_timeout_seconds: 0,
        }
    }
}

impl TimeoutConfig {
    /// Validate timeout bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // overall_seconds must be in (0, 86400]
        if self.overall_seconds == 0 || self.overall_seconds > 86400 {
            return Err(TimeoutValidationError::OverallOutOfBounds {
                value: self.overall_seconds,
            });
        }

        // idle_event_seconds must be in (0, overall_seconds]
        if self.idle_event_seconds == 0 || self.idle_event_seconds > self.overall_seconds {
            return Err(TimeoutValidationError::IdleOutOfBounds {
                value: self.idle_event_seconds,
                max: self.overall_seconds,
            });
        }

        // connect_timeout_seconds must be in (0, 300]
        if self.connect_timeout_seconds == 0 || self.connect_timeout_seconds > 300 {
            return Err(TimeoutValidationError::ConnectOutOfBounds {
                value: self.connect_timeout_seconds,
            });
        }

        // fetch_timeout_seconds must be 0 or at most a day
        if self.fetch_timeout_seconds > 86400 {
            return Err(TimeoutValidationError::FetchOutOfBounds {
                value: self.fetch_timeout_seconds,
            });
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// `None` when the fetch is unbounded.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        match self.fetch_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("overall_seconds must be in (0, 86400], got {value}")]
    OverallOutOfBounds { value: u64 },

    #[error("idle_event_seconds must be in (0, {max}], got {value}")]
    IdleOutOfBounds { value: u64, max: u64 },

    #[error("connect_timeout_seconds must be in (0, 300], got {value}")]
    ConnectOutOfBounds { value: u64 },

    #[error("fetch_timeout_seconds must be in [0, 86400], got {value}")]
    FetchOutOfBounds { value: u64 },
}

/// Timeout check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// No timeout has occurred
    Ok,
    /// Overall wall-clock timeout exceeded
    OverallTimeout,
    /// Idle timeout exceeded
    IdleTimeout,
}

/// Timeout enforcer for one event stream
///
/// Tracks wall-clock time and activity. The enforcer does not cancel
/// anything itself; the stream reader asks it how long it may wait and what
/// went wrong when a wait elapses.
#[derive(Debug)]
pub struct TimeoutEnforcer {
    config: TimeoutConfig,
    start_time: Instant,
    last_activity: Instant,
}

impl TimeoutEnforcer {
    pub fn new(config: TimeoutConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            start_time: now,
            last_activity: now,
        }
    }

    /// Update the last activity timestamp
    ///
    /// Call this whenever bytes arrive from the exporter.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Check for timeout conditions
    pub fn check(&self) -> TimeoutStatus {
        let now = Instant::now();

        // Check overall timeout first
        let elapsed = now.duration_since(self.start_time);
        if elapsed >= Duration::from_secs(self.config.overall_seconds) {
            return TimeoutStatus::OverallTimeout;
        }

        let idle_duration = now.duration_since(self.last_activity);
        if idle_duration >= Duration::from_secs(self.config.idle_event_seconds) {
            return TimeoutStatus::IdleTimeout;
        }

        TimeoutStatus::Ok
    }

    /// Get elapsed time since the stream started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get remaining time before overall timeout
    pub fn overall_remaining(&self) -> Duration {
        Duration::from_secs(self.config.overall_seconds).saturating_sub(self.elapsed())
    }

    /// Get remaining time before idle timeout
    pub fn idle_remaining(&self) -> Duration {
        Duration::from_secs(self.config.idle_event_seconds)
            .saturating_sub(self.last_activity.elapsed())
    }

    /// How long the next read may wait before one of the limits is hit.
    pub fn next_wait(&self) -> Duration {
        self.overall_remaining().min(self.idle_remaining())
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}
