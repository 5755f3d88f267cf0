//! Deterministic decision-maker driven by a fixed script.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Decision, DecisionMaker};
use crate::agent_loop::types::{SessionState, TaskRequest};
use crate::error::{Result, ToolMeshError};
use crate::mcp::aggregate::MergedCatalog;

type ScriptStep = Box<dyn Fn(&MergedCatalog, &SessionState) -> Result<Decision> + Send + Sync>;

/// Returns the `n`th scripted decision once the session holds `n` steps.
///
/// The script is indexed by session length, so one instance can drive any
/// number of tasks.
#[derive(Default)]
pub struct ScriptedDecisionMaker {
    steps: Vec<ScriptStep>,
    delay: Option<Duration>,
}

impl ScriptedDecisionMaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step computed from the catalog and the session so far.
    pub fn then(
        mut self,
        step: impl Fn(&MergedCatalog, &SessionState) -> Result<Decision> + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn then_call(self, tool_name: impl Into<String>, arguments: Value) -> Self {
        let decision = Decision::call(tool_name, arguments);
        self.then(move |_, _| Ok(decision.clone()))
    }

    pub fn then_finish(self, answer: impl Into<String>) -> Self {
        let decision = Decision::finish(answer);
        self.then(move |_, _| Ok(decision.clone()))
    }

    /// Finish with the text of the last step's result.
    pub fn then_finish_with_last_result(self) -> Self {
        self.then(|_, session| {
            let answer = session
                .last()
                .map(|step| step.result.payload_text())
                .unwrap_or_default();
            Ok(Decision::finish(answer))
        })
    }

    /// Simulated thinking time before every decision.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl DecisionMaker for ScriptedDecisionMaker {
    async fn decide(
        &self,
        _task: &TaskRequest,
        catalog: &MergedCatalog,
        session: &SessionState,
    ) -> Result<Decision> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.steps.get(session.len()).ok_or_else(|| {
            ToolMeshError::DecisionMaker(format!(
                "script exhausted after {} steps",
                self.steps.len()
            ))
        })?;
        step(catalog, session)
    }
}
