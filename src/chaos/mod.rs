//! Probabilistic fault injection for exercising the other primitives

pub mod injector;
pub mod types;

pub use injector::{ChaosFaultInjector, Corruptible};
pub use types::{
    ChaosConfig, ChaosStats, FaultToggle, FaultType, NetworkDelayFault, NetworkFailureFault,
    TimeoutFault, UpstreamErrorFault,
};
