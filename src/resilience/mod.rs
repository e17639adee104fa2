//! Fault-tolerance processors: wrap a fallible operation with a circuit
//! breaker or retry policy, or route persistently-failing items to a dead
//! letter queue instead of stalling the pipeline.

mod circuit_breaker;
mod dlq;
mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use dlq::{DeadLetterQueue, DlqItem, DlqStats};
pub use retry::Retry;
