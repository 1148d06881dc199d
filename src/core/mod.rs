// Execution substrate: ordering, process execution, admission control

pub mod cache;
pub mod executor;
pub mod group;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;

pub use cache::{CacheStats, ResultCache, cache_key};
pub use executor::*;
pub use group::{TaskGroup, TaskOutcome, TaskReport};
pub use rate_limiter::{Admission, RateLimitConfig, RateLimiter, RateLimiterStats};
pub use retry::{RetryPolicy, run_with_retry};
pub use scheduler::*;
