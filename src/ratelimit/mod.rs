//! Sliding-window rate limiting logic.

mod backend;
mod bucket;
mod clock;
mod identity;
mod limiter;
mod policy;

pub use backend::RateLimiterBackend;
pub use bucket::{current_bucket, BucketIndex, BucketSpan};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{ClientKey, IdentityHasher, Salt, StoreKey, DEFAULT_POOL_CAPACITY};
pub use limiter::{
    Decision, LimiterOptions, SlidingWindowLimiter, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT,
};
pub use policy::RateLimitPolicy;
