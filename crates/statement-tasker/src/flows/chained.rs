//! Chained flow: child flows run as blocking sub-invocations.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{Flow, FlowOutcome, FlowRuntime, FlowTrace};

/// Builds a chain by prepending steps.
///
/// The chain runs steps front to back, so the step pushed last runs first.
#[derive(Default)]
pub struct ChainBuilder {
    steps: VecDeque<(String, Arc<dyn Flow>)>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `flow` in front of the steps added so far.
    pub fn push_front(mut self, name: impl Into<String>, flow: Arc<dyn Flow>) -> Self {
        self.steps.push_front((name.into(), flow));
        self
    }

    pub fn build(self, name: impl Into<String>) -> ChainedFlow {
        ChainedFlow {
            name: name.into(),
            steps: self.steps.into_iter().collect(),
        }
    }
}

/// Runs child flows in order, stopping at the first failure.
pub struct ChainedFlow {
    name: String,
    steps: Vec<(String, Arc<dyn Flow>)>,
}

impl ChainedFlow {
    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[async_trait]
impl Flow for ChainedFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, runtime: &FlowRuntime, execution_id: &str) -> FlowOutcome {
        let mut trace = FlowTrace::new(&self.name);
        let mut outputs = serde_json::Map::new();

        for (name, flow) in &self.steps {
            trace.visit(name.clone());

            let child_execution = format!("{}/{}", execution_id, name);
            let child = flow.run(runtime, &child_execution).await;

            if !child.succeeded {
                return trace.finish(
                    super::FAIL,
                    false,
                    serde_json::json!({
                        "FailedStep": name,
                        "Outcome": child,
                    }),
                );
            }
            outputs.insert(name.clone(), child.output);
        }

        trace.succeed(serde_json::Value::Object(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Flow for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _runtime: &FlowRuntime, _execution_id: &str) -> FlowOutcome {
            FlowTrace::new(self.0).succeed(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_push_front_reverses_order() {
        let chain = ChainBuilder::new()
            .push_front("third", Arc::new(Named("c")))
            .push_front("second", Arc::new(Named("b")))
            .push_front("first", Arc::new(Named("a")))
            .build("chain");

        assert_eq!(chain.step_names(), vec!["first", "second", "third"]);
    }
}
