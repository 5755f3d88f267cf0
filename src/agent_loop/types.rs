//! Core task types for the invocation loop.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::mcp::channel::ToolCallResult;
use crate::util::timeout::Deadline;

/// Unique task identifier.
pub type TaskId = Uuid;

/// A task handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub description: String,
    /// Selects per-type limits (e.g. `math`, `weather`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            description: description.into(),
            task_type: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One routed tool call issued by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub task_id: TaskId,
    pub step_index: usize,
    /// Budget left at dispatch time.
    pub budget_ms: u64,
    #[serde(skip)]
    pub deadline: Deadline,
}

/// A request paired with its result.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStep {
    pub request: ToolCallRequest,
    pub result: ToolCallResult,
}

/// Ordered steps of one task invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub task_id: TaskId,
    steps: Vec<SessionStep>,
}

impl SessionState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: SessionStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[SessionStep] {
        &self.steps
    }

    pub fn last(&self) -> Option<&SessionStep> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps whose call did not succeed.
    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| !step.result.is_success())
            .count()
    }
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    AwaitingDecision,
    AwaitingToolResult,
    Completed,
    Failed,
    Canceled,
}

impl OrchestratorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Final task status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Canceled,
}

/// Result of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session: SessionState,
    pub finished_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn completed(answer: impl Into<String>, session: SessionState) -> Self {
        Self {
            task_id: session.task_id,
            status: TaskStatus::Completed,
            answer: Some(answer.into()),
            error: None,
            session,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>, session: SessionState) -> Self {
        Self {
            task_id: session.task_id,
            status: TaskStatus::Failed,
            answer: None,
            error: Some(error.into()),
            session,
            finished_at: Utc::now(),
        }
    }

    pub fn canceled(session: SessionState) -> Self {
        Self {
            task_id: session.task_id,
            status: TaskStatus::Canceled,
            answer: None,
            error: None,
            session,
            finished_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
