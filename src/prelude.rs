//! Convenience re-exports for common use.

pub use crate::agent_loop::{Orchestrator, RunHandle, TaskOutcome, TaskRequest, TaskStatus};
pub use crate::config::{ServerConfig, ToolMeshConfig};
pub use crate::decision::{ChatDecisionMaker, Decision, DecisionMaker, ScriptedDecisionMaker};
pub use crate::error::{Result, ToolMeshError};
pub use crate::mcp::{
    CollisionPolicy, MergedCatalog, MultiServerClient, ToolCallOutcome, ToolCallResult,
};
pub use crate::util::timeout::Deadline;
