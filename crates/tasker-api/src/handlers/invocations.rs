//! Workflow task invocation endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use statement_tasker::store::PendingCallbackRecord;
use statement_tasker::TaskerError;

use crate::error::ApiResult;
use crate::state::AppState;

/// Dispatch an invocation request.
///
/// `POST /api/invocations`
///
/// The body is the loosely typed request object workflow tasks send; the
/// response is whatever the requested action returns.
pub async fn invoke(
    State(state): State<AppState>,
    Json(request): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let response = state.router.handle_value(request).await?;
    Ok(Json(response))
}

/// Latest pending callback record of an execution.
///
/// `GET /api/executions/{execution_id}/latest`
pub async fn latest_invocation(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<PendingCallbackRecord>> {
    let record = state.store.latest_record(&execution_id).await?.ok_or_else(|| {
        TaskerError::PreviousExecutionNotFound(format!("no invocation found for execution {}", execution_id))
    })?;
    Ok(Json(record))
}
