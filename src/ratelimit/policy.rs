//! Sliding-window rate limit policy.

use std::time::Duration;

use crate::error::{GateError, Result};

/// A single limit/window pair, validated once at startup.
///
/// The window is divided into `num_sub_windows` equally sized buckets. The
/// policy is immutable after construction and is shared read-only by every
/// admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    limit: u64,
    window_size: Duration,
    sub_window_size: Duration,
    window_size_ms: u64,
    sub_window_size_ms: u64,
    num_sub_windows: u64,
}

impl RateLimitPolicy {
    /// Create a new policy.
    ///
    /// # Errors
    /// Returns [`GateError::Config`] if the limit is zero, either duration is
    /// shorter than one millisecond, the sub-window is longer than the window,
    /// or the window is not an exact multiple of the sub-window.
    pub fn new(limit: u64, window_size: Duration, sub_window_size: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GateError::Config("limit must be greater than zero".into()));
        }

        let window_size_ms = duration_millis(window_size, "window_size")?;
        let sub_window_size_ms = duration_millis(sub_window_size, "sub_window_size")?;

        if sub_window_size_ms > window_size_ms {
            return Err(GateError::Config(format!(
                "sub_window_size ({}ms) must not exceed window_size ({}ms)",
                sub_window_size_ms, window_size_ms
            )));
        }

        if window_size_ms % sub_window_size_ms != 0 {
            return Err(GateError::Config(format!(
                "window_size ({}ms) must be an exact multiple of sub_window_size ({}ms)",
                window_size_ms, sub_window_size_ms
            )));
        }

        Ok(Self {
            limit,
            window_size,
            sub_window_size,
            window_size_ms,
            sub_window_size_ms,
            num_sub_windows: window_size_ms / sub_window_size_ms,
        })
    }

    /// Maximum admitted requests per window (inclusive).
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    pub fn sub_window_size(&self) -> Duration {
        self.sub_window_size
    }

    pub fn window_size_ms(&self) -> u64 {
        self.window_size_ms
    }

    pub fn sub_window_size_ms(&self) -> u64 {
        self.sub_window_size_ms
    }

    /// Number of buckets summed per decision.
    pub fn num_sub_windows(&self) -> u64 {
        self.num_sub_windows
    }
}

fn duration_millis(duration: Duration, name: &str) -> Result<u64> {
    let millis = u64::try_from(duration.as_millis())
        .map_err(|_| GateError::Config(format!("{} is too large", name)))?;
    if millis == 0 {
        return Err(GateError::Config(format!(
            "{} must be at least one millisecond",
            name
        )));
    }
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return Err(GateError::Config(format!(
            "{} must be a whole number of milliseconds",
            name
        )));
    }
    Ok(millis)
}
