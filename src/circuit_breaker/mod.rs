pub mod breaker;
pub mod types;

pub use breaker::{CircuitBreaker, CircuitPermit};
pub use types::{CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
