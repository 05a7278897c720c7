//! Statement Tasker API
//!
//! HTTP surface over the invocation router: workflow tasks post invocation
//! requests and look up the latest invocation of an execution.

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use router::build_router;
pub use state::AppState;
