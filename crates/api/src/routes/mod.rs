//! HTTP route handlers.

pub mod billing;
pub mod health;
pub mod metrics;
pub mod patients;
pub mod webhooks;
