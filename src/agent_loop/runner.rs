//! Invocation orchestrator: a bounded decide/call loop over the merged catalog.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSettings;
use crate::decision::{Decision, DecisionMaker};
use crate::error::{Result, ToolMeshError};
use crate::mcp::aggregate::MultiServerClient;
use crate::mcp::channel::{ToolCallOutcome, ToolCallResult};
use crate::util::timeout::{with_deadline, Deadline};

use super::events::{RunEventEmitter, RunEventPayload, RunEventSink};
use super::limits::TaskLimits;
use super::types::{
    OrchestratorState, SessionState, SessionStep, TaskId, TaskOutcome, TaskRequest,
    ToolCallRequest,
};

/// Handle for an in-flight task.
#[derive(Debug)]
pub struct RunHandle {
    task_id: TaskId,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<TaskOutcome>,
}

impl RunHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Request cancellation. Returns false if already requested.
    pub fn abort(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub async fn wait(self) -> TaskOutcome {
        let task_id = self.task_id;
        self.result_rx
            .await
            .unwrap_or_else(|_| TaskOutcome::canceled(SessionState::new(task_id)))
    }
}

enum Interrupted {
    Canceled,
    Error(ToolMeshError),
}

/// Tracks the state machine and emits lifecycle events.
struct Lifecycle<'a> {
    emitter: &'a RunEventEmitter,
    state: OrchestratorState,
}

impl Lifecycle<'_> {
    fn transition(&mut self, to: OrchestratorState) {
        if self.state == to || self.state.is_terminal() {
            return;
        }
        let from = self.state;
        self.state = to;
        self.emitter.emit(RunEventPayload::StateChanged { from, to });
    }

    fn complete(mut self, answer: String, session: SessionState) -> TaskOutcome {
        self.transition(OrchestratorState::Completed);
        tracing::info!(task_id = %session.task_id, steps = session.len(), "task completed");
        self.emitter.emit(RunEventPayload::Completed {
            answer: answer.clone(),
        });
        TaskOutcome::completed(answer, session)
    }

    fn fail(mut self, error: String, session: SessionState) -> TaskOutcome {
        self.transition(OrchestratorState::Failed);
        tracing::warn!(task_id = %session.task_id, steps = session.len(), error = %error, "task failed");
        self.emitter.emit(RunEventPayload::Failed {
            error: error.clone(),
        });
        TaskOutcome::failed(error, session)
    }

    fn cancel(mut self, session: SessionState) -> TaskOutcome {
        self.transition(OrchestratorState::Canceled);
        tracing::info!(task_id = %session.task_id, steps = session.len(), "task canceled");
        self.emitter.emit(RunEventPayload::Canceled);
        TaskOutcome::canceled(session)
    }
}

async fn guarded<T>(
    cancel: &CancellationToken,
    deadline: Deadline,
    future: impl Future<Output = Result<T>>,
) -> std::result::Result<T, Interrupted> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Canceled),
        result = with_deadline(deadline, future) => result.map_err(Interrupted::Error),
    }
}

/// Drives tasks against a [`MultiServerClient`] using a [`DecisionMaker`].
#[derive(Clone)]
pub struct Orchestrator {
    client: Arc<MultiServerClient>,
    decision_maker: Arc<dyn DecisionMaker>,
    settings: AgentSettings,
    event_sink: Option<RunEventSink>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<MultiServerClient>,
        decision_maker: Arc<dyn DecisionMaker>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            client,
            decision_maker,
            settings,
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: RunEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn client(&self) -> &Arc<MultiServerClient> {
        &self.client
    }

    /// Run a task to completion.
    pub async fn run(&self, task: TaskRequest) -> TaskOutcome {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Spawn a task and return a handle that can abort it.
    pub fn start(&self, task: TaskRequest) -> RunHandle {
        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        let task_id = task.task_id;
        let orchestrator = self.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            let outcome = orchestrator.run_with_cancel(task, token).await;
            let _ = result_tx.send(outcome);
        });

        RunHandle {
            task_id,
            cancel,
            result_rx,
        }
    }

    /// Run a task until it finishes or `cancel` fires.
    ///
    /// Tool failures are recorded in the session and handed back to the
    /// decision-maker; only decision errors, the step limit and the task
    /// deadline fail the task.
    pub async fn run_with_cancel(&self, task: TaskRequest, cancel: CancellationToken) -> TaskOutcome {
        let limits = TaskLimits::resolve(&task, &self.settings);
        let task_deadline = Deadline::after(limits.task_timeout);
        let emitter = RunEventEmitter::new(task.task_id, self.event_sink.clone());
        let mut lifecycle = Lifecycle {
            emitter: &emitter,
            state: OrchestratorState::Idle,
        };
        let mut session = SessionState::new(task.task_id);

        tracing::info!(
            task_id = %task.task_id,
            task_type = task.task_type.as_deref().unwrap_or("default"),
            max_steps = limits.max_steps,
            step_timeout_ms = limits.step_timeout.as_millis() as u64,
            task_timeout_ms = limits.task_timeout.as_millis() as u64,
            "task started"
        );

        let catalog = match guarded(&cancel, task_deadline, self.client.catalog()).await {
            Ok(catalog) => catalog,
            Err(Interrupted::Canceled) => return lifecycle.cancel(session),
            Err(Interrupted::Error(error)) => {
                return lifecycle.fail(format!("tool catalog unavailable: {error}"), session)
            }
        };

        let deadline_exceeded = || {
            format!(
                "task deadline of {}ms exceeded",
                limits.task_timeout.as_millis()
            )
        };

        loop {
            if task_deadline.is_expired() {
                return lifecycle.fail(deadline_exceeded(), session);
            }
            lifecycle.transition(OrchestratorState::AwaitingDecision);
            let decision = match guarded(
                &cancel,
                task_deadline,
                self.decision_maker.decide(&task, &catalog, &session),
            )
            .await
            {
                Ok(decision) => decision,
                Err(Interrupted::Canceled) => return lifecycle.cancel(session),
                Err(Interrupted::Error(ToolMeshError::Timeout(_))) => {
                    return lifecycle.fail(deadline_exceeded(), session)
                }
                Err(Interrupted::Error(error)) => {
                    return lifecycle.fail(format!("decision-maker failed: {error}"), session)
                }
            };

            let (call_id, tool_name, arguments) = match decision {
                Decision::Finish { answer } => return lifecycle.complete(answer, session),
                Decision::CallTool {
                    call_id,
                    tool_name,
                    arguments,
                } => (call_id, tool_name, arguments),
            };

            let step_index = session.len();
            if step_index >= limits.max_steps {
                return lifecycle.fail(
                    format!("max steps ({}) exceeded", limits.max_steps),
                    session,
                );
            }
            if task_deadline.is_expired() {
                return lifecycle.fail(deadline_exceeded(), session);
            }

            let deadline = task_deadline.capped(Some(limits.step_timeout));
            let request = ToolCallRequest {
                call_id: call_id.unwrap_or_else(|| format!("call_{step_index}")),
                tool_name,
                arguments,
                task_id: task.task_id,
                step_index,
                budget_ms: deadline.remaining_ms(),
                deadline,
            };

            lifecycle.transition(OrchestratorState::AwaitingToolResult);
            emitter.emit(RunEventPayload::ToolCallStarted {
                request: request.clone(),
            });
            tracing::debug!(
                task_id = %task.task_id,
                step = step_index,
                tool = %request.tool_name,
                budget_ms = request.budget_ms,
                "dispatching tool call"
            );

            let started = Instant::now();
            let routed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return lifecycle.cancel(session),
                routed = self.client.call_tool(&request.tool_name, request.arguments.clone(), deadline) => routed,
            };
            let result = routed.unwrap_or_else(|error| unrouted_result(&request.tool_name, error, started));

            emitter.emit(RunEventPayload::ToolCallFinished {
                step_index,
                result: result.clone(),
            });
            if !result.is_success() {
                let reason = result.payload_text();
                tracing::warn!(
                    task_id = %task.task_id,
                    step = step_index,
                    tool = %request.tool_name,
                    reason = %reason,
                    "step failed"
                );
                emitter.emit(RunEventPayload::StepFailed {
                    step_index,
                    tool_name: request.tool_name.clone(),
                    reason,
                });
            }

            session.push(SessionStep { request, result });
        }
    }
}

/// Result for a call the client refused to route (unknown tool, shut down).
fn unrouted_result(tool_name: &str, error: ToolMeshError, started: Instant) -> ToolCallResult {
    let outcome = match error {
        ToolMeshError::UnknownTool(name) => ToolCallOutcome::ToolError {
            message: format!("unknown tool '{name}'"),
        },
        ToolMeshError::Timeout(after_ms) => ToolCallOutcome::Timeout { after_ms },
        other => ToolCallOutcome::TransportError {
            message: other.to_string(),
        },
    };
    ToolCallResult {
        tool_name: tool_name.to_owned(),
        server_id: String::new(),
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}
