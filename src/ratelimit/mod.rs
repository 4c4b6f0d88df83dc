//! Rate limiting logic and state management.

mod batch;
mod cache;
mod clock;
mod engine;
mod key;
mod limiter;
mod types;

pub use batch::{BatchOptions, BatchProcessor};
pub use cache::DenialCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Observation, RateLimitEngine};
pub use key::{
    mask_credential, AuthenticatedUser, KeyFn, KeyStrategy, KeyStrategyKind, RequestContext,
};
pub use limiter::{LimitConfig, RateLimiter, RetryPolicy};
pub use types::{
    Algorithm, Priority, RateLimitRequest, RateLimitResult, ERROR_HITS, MAX_KEY_LENGTH,
    MAX_REQUESTS_LIMIT, MAX_WINDOW_MS,
};
