//! Mapping from wall-clock time to sub-window buckets.

/// Index of a sub-window: `floor(now_ms / sub_window_size_ms)`.
pub type BucketIndex = i64;

/// The current bucket and the trailing aggregation window ending at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpan {
    /// Bucket that receives the increment for this check.
    pub current: BucketIndex,
    /// `[current, current - 1, ..., current - num_sub_windows + 1]`.
    pub trailing: Vec<BucketIndex>,
}

impl BucketSpan {
    /// Compute the span for one timestamp.
    ///
    /// Callers guarantee `sub_window_size_ms > 0` and `num_sub_windows >= 1`;
    /// both are enforced by [`RateLimitPolicy`](super::RateLimitPolicy).
    pub fn at(now_ms: u64, sub_window_size_ms: u64, num_sub_windows: u64) -> Self {
        let current = current_bucket(now_ms, sub_window_size_ms);
        let trailing = (0..num_sub_windows as i64)
            .map(|offset| current - offset)
            .collect();
        Self { current, trailing }
    }

    /// Field name under which the current bucket is stored.
    pub fn current_field(&self) -> String {
        self.current.to_string()
    }

    /// Field names of every bucket in the trailing window, newest first.
    pub fn trailing_fields(&self) -> Vec<String> {
        self.trailing.iter().map(|b| b.to_string()).collect()
    }

    /// Milliseconds from `now_ms` until the current bucket closes.
    pub fn millis_until_rollover(&self, now_ms: u64, sub_window_size_ms: u64) -> u64 {
        let end = (self.current as u64 + 1) * sub_window_size_ms;
        end.saturating_sub(now_ms)
    }
}

/// `floor(now_ms / sub_window_size_ms)`.
pub fn current_bucket(now_ms: u64, sub_window_size_ms: u64) -> BucketIndex {
    (now_ms / sub_window_size_ms) as BucketIndex
}
