//! Fault isolation for outbound calls: a circuit breaker and bounded retry.
//!
//! The retry loop wraps the breaker, so every retry passes through it and an
//! open breaker ends the loop at once.

mod breaker;
mod retry;

pub use breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::RetryPolicy;

/// Classifies errors worth retrying and counting against a breaker.
pub trait TransientError {
    fn is_transient(&self) -> bool;
}
