//! Client for the asynchronous SQL statement service.
//!
//! Provides the data model, a gateway trait over the execute / describe /
//! cancel / get-result operations, an HTTP implementation and a scripted
//! in-memory simulator.

pub mod error;
pub mod gateway;
pub mod http;
pub mod model;
pub mod simulated;

pub use error::GatewayError;
pub use gateway::StatementGateway;
pub use http::HttpStatementGateway;
pub use model::{
    ExecuteStatementRequest, StatementDescription, StatementResult, StatementStatus,
    StatementTarget, StatusChangeDetail, StatusChangeNotification,
};
pub use simulated::SimulatedGateway;
