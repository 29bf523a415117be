//! Token bucket rate limiting
//!
//! - [`TokenBucketRateLimiter`]: a single bucket, refilled lazily from elapsed time
//! - [`MultiClientRateLimiter`]: one bucket per client key with idle eviction
//!
//! # Example
//!
//! ```rust,no_run
//! use upstream_resilience::rate_limit::{RateLimitConfig, TokenBucketRateLimiter};
//!
//! let limiter = TokenBucketRateLimiter::new("payments", RateLimitConfig::default());
//! if let Err(e) = limiter.try_consume() {
//!     eprintln!("slow down: {e}");
//! }
//! ```

pub mod bucket;
pub mod local;
pub mod types;

pub use bucket::TokenBucketRateLimiter;
pub use local::MultiClientRateLimiter;
pub use types::{MultiClientConfig, RateLimitConfig, RateLimiterStats};
