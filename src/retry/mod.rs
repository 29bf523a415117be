pub mod executor;
pub mod types;

pub use executor::{apply_jitter, RetryExecutor};
pub use types::{RetryAttempt, RetryConfig, RetryStats};
