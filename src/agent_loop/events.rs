//! Run event stream types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mcp::channel::ToolCallResult;

use super::types::{OrchestratorState, TaskId, ToolCallRequest};

/// Callback used for streaming run events.
pub type RunEventSink = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Concrete event payloads emitted by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventPayload {
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    ToolCallStarted {
        request: ToolCallRequest,
    },
    ToolCallFinished {
        step_index: usize,
        result: ToolCallResult,
    },
    /// A step that did not succeed; reported to the decision-maker, not fatal.
    StepFailed {
        step_index: usize,
        tool_name: String,
        reason: String,
    },
    Completed {
        answer: String,
    },
    Failed {
        error: String,
    },
    Canceled,
}

/// Envelope for run events. `seq` increases monotonically per task.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub task_id: TaskId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: RunEventPayload,
}

pub(crate) struct RunEventEmitter {
    task_id: TaskId,
    seq: AtomicU64,
    sink: Option<RunEventSink>,
}

impl RunEventEmitter {
    pub(crate) fn new(task_id: TaskId, sink: Option<RunEventSink>) -> Self {
        Self {
            task_id,
            seq: AtomicU64::new(1),
            sink,
        }
    }

    pub(crate) fn emit(&self, payload: RunEventPayload) {
        let Some(sink) = &self.sink else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (sink)(RunEvent {
            task_id: self.task_id,
            seq,
            timestamp: Utc::now(),
            payload,
        });
    }
}
