//! Statement Tasker
//!
//! Lets workflow tasks wait on asynchronous warehouse statements.
//!
//! This crate provides:
//! - Starter that records a pending callback and issues the statement
//! - Completion listener and work queue for status change notifications
//! - Completer that correlates completions with pending callbacks
//! - Invocation router for the task-facing request surface
//! - Orchestration flows built on the callback primitive

pub mod completer;
pub mod config;
pub mod error;
pub mod event;
pub mod flows;
pub mod identity;
pub mod invocation;
pub mod listener;
pub mod nats;
pub mod queue;
pub mod retry;
pub mod signal;
pub mod starter;
pub mod store;
pub mod worker;

pub use completer::{Completer, ResolveOutcome};
pub use config::TaskerConfig;
pub use error::{TaskerError, TaskerResult};
pub use event::CompletionEvent;
pub use identity::InvocationKey;
pub use invocation::{Action, ExecuteResponse, InvocationRequest, InvocationRouter};
pub use listener::CompletionListener;
pub use retry::RetryPolicy;
pub use starter::{StartMode, StartRequest, StartedStatement, Starter};
pub use store::TrackingStore;
pub use worker::CompletionWorker;
