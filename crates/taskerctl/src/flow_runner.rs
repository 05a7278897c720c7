//! In-process flow runs against live NATS and the statement service.
//!
//! Callbacks arrive over NATS, so a `tasker-worker` must be running against
//! the same NATS server for waiting flows to make progress.

use anyhow::Result;
use clap::ValueEnum;
use std::sync::Arc;
use std::time::Duration;

use statement_api::{HttpStatementGateway, StatementGateway};
use statement_tasker::flows::{
    CancellingFlow, ChainBuilder, ChainedFlow, Flow, FlowOutcome, FlowRuntime, ParallelSingletonFlow, PollingFlow,
    SingleFailureFlow, SingleSuccessFlow, SuccessAndFailFlow,
};
use statement_tasker::identity::adhoc_execution_id;
use statement_tasker::signal::{spawn_callback_listener, CallbackHub};
use statement_tasker::store::NatsKv;
use statement_tasker::{InvocationRouter, Starter, TaskerConfig, TrackingStore};

const VALID_SQL: &str = "select getdate()";
const INVALID_SQL: &str = "select get_date()";

const CREATE_UDF_SLOW: &str = r#"
create or replace function public.f_slow(str_in varchar(50), int_in int)
returns varchar(50)
stable as $$
  import time
  time.sleep(int_in)
  return str_in
$$ language plpythonu;
"#;

const CANCEL_HEARTBEAT: Duration = Duration::from_secs(10);
const PARALLEL_BRANCHES: usize = 10;
const PARALLEL_HEARTBEAT: Duration = Duration::from_secs(300);

fn slow_sql(seconds: u32) -> String {
    format!("select public.f_slow(getdate()::varchar(50), {})", seconds)
}

/// Runnable orchestration patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FlowPattern {
    SingleSuccess,
    SingleFailure,
    SuccessAndFail,
    Polling,
    Cancelling,
    Parallel,
    /// Every other pattern, one after the other
    Chained,
}

impl FlowPattern {
    fn name(self) -> &'static str {
        match self {
            FlowPattern::SingleSuccess => "single-success",
            FlowPattern::SingleFailure => "single-failure",
            FlowPattern::SuccessAndFail => "success-and-fail",
            FlowPattern::Polling => "polling",
            FlowPattern::Cancelling => "cancelling",
            FlowPattern::Parallel => "parallel",
            FlowPattern::Chained => "chained",
        }
    }
}

fn build_flow(pattern: FlowPattern, sql: Option<String>) -> Arc<dyn Flow> {
    match pattern {
        FlowPattern::SingleSuccess => Arc::new(SingleSuccessFlow::new(sql.unwrap_or_else(|| VALID_SQL.to_string()))),
        FlowPattern::SingleFailure => {
            Arc::new(SingleFailureFlow::new(sql.unwrap_or_else(|| INVALID_SQL.to_string())))
        }
        FlowPattern::SuccessAndFail => Arc::new(SuccessAndFailFlow::new(
            VALID_SQL,
            sql.unwrap_or_else(|| INVALID_SQL.to_string()),
        )),
        FlowPattern::Polling => Arc::new(PollingFlow::new(sql.unwrap_or_else(|| slow_sql(60)))),
        FlowPattern::Cancelling => Arc::new(
            CancellingFlow::new(sql.unwrap_or_else(|| slow_sql(600)), CANCEL_HEARTBEAT).with_setup(CREATE_UDF_SLOW),
        ),
        FlowPattern::Parallel => Arc::new(
            ParallelSingletonFlow::new(sql.unwrap_or_else(|| slow_sql(59)), PARALLEL_BRANCHES, PARALLEL_BRANCHES)
                .with_heartbeat(PARALLEL_HEARTBEAT),
        ),
        FlowPattern::Chained => Arc::new(chained()),
    }
}

/// All other patterns chained, cancelling first.
fn chained() -> ChainedFlow {
    ChainBuilder::new()
        .push_front("singleFailure", build_flow(FlowPattern::SingleFailure, None))
        .push_front("singleSuccess", build_flow(FlowPattern::SingleSuccess, None))
        .push_front("parallelNoConcurrency", build_flow(FlowPattern::Parallel, None))
        .push_front("successAndFail", build_flow(FlowPattern::SuccessAndFail, None))
        .push_front("polling", build_flow(FlowPattern::Polling, None))
        .push_front("cancelling", build_flow(FlowPattern::Cancelling, None))
        .build("chained")
}

/// Run one flow to completion.
pub async fn run(
    pattern: FlowPattern,
    nats_url: &str,
    execution_id: Option<String>,
    sql: Option<String>,
) -> Result<FlowOutcome> {
    let mut config = TaskerConfig::from_env()?;
    config.nats_url = nats_url.to_string();

    let client = statement_tasker::nats::connect(&config.nats_url).await?;
    let kv = NatsKv::open(client.clone(), &config.tracking_bucket, config.record_ttl()).await?;
    let store = TrackingStore::new(Arc::new(kv), config.record_ttl());

    let gateway: Arc<dyn StatementGateway> = Arc::new(HttpStatementGateway::new(&config.statement_endpoint));
    let starter = Arc::new(Starter::new(
        store.clone(),
        gateway.clone(),
        config.target(),
        config.retry_policy(),
        config.issue_timeout(),
    ));
    let router = InvocationRouter::new(starter.clone(), store, gateway, config.retry_policy());

    let hub = CallbackHub::new();
    let callbacks = spawn_callback_listener(client, &config.callback_subject_prefix, hub.clone()).await?;
    let runtime = FlowRuntime::new(hub, starter, router, config.heartbeat(), config.poll_interval());

    let execution_id = execution_id.unwrap_or_else(|| format!("{}/{}", adhoc_execution_id(), pattern.name()));
    tracing::info!(flow = pattern.name(), execution_id = %execution_id, "Running flow");

    let flow = build_flow(pattern, sql);
    let outcome = flow.run(&runtime, &execution_id).await;

    callbacks.abort();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_runs_cancelling_first() {
        assert_eq!(
            chained().step_names(),
            vec![
                "cancelling",
                "polling",
                "successAndFail",
                "parallelNoConcurrency",
                "singleSuccess",
                "singleFailure",
            ]
        );
    }

    #[test]
    fn test_pattern_names() {
        assert_eq!(build_flow(FlowPattern::Polling, Some("select 1".to_string())).name(), "polling");
        assert_eq!(build_flow(FlowPattern::Parallel, None).name(), "parallel-singleton");
        assert_eq!(FlowPattern::SuccessAndFail.name(), "success-and-fail");
    }
}
