//! Fallback substitution for failed upstream calls

pub mod executor;
pub mod types;

pub use executor::FallbackExecutor;
pub use types::{
    CachedValue, DegradedHandler, FallbackConfig, FallbackOptions, FallbackResult, FallbackSource,
    FallbackStats, FallbackStrategy,
};
