//! HTTP handlers.

pub mod health;
pub mod invocations;

pub use health::health_check;
pub use invocations::{invoke, latest_invocation};
