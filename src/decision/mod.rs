//! Decision-makers: choose the next tool call or the final answer.

pub mod chat;
pub mod scripted;

pub use chat::ChatDecisionMaker;
pub use scripted::ScriptedDecisionMaker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent_loop::types::{SessionState, TaskRequest};
use crate::error::Result;
use crate::mcp::aggregate::MergedCatalog;

/// What to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    CallTool {
        /// Echoed back in the session; generated when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
    Finish {
        answer: String,
    },
}

impl Decision {
    pub fn call(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self::CallTool {
            call_id: None,
            tool_name: tool_name.into(),
            arguments,
        }
    }

    pub fn finish(answer: impl Into<String>) -> Self {
        Self::Finish {
            answer: answer.into(),
        }
    }
}

/// External collaborator that drives the invocation loop.
#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(
        &self,
        task: &TaskRequest,
        catalog: &MergedCatalog,
        session: &SessionState,
    ) -> Result<Decision>;
}
