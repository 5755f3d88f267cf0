use std::collections::HashMap;
use std::time::Duration;

use crate::config::AgentSettings;

use super::types::TaskRequest;

const MAX_STEPS_ENV: &str = "TOOLMESH_MAX_STEPS";
const STEP_TIMEOUT_ENV: &str = "TOOLMESH_STEP_TIMEOUT_MS";
const TASK_TIMEOUT_ENV: &str = "TOOLMESH_TASK_TIMEOUT_MS";
const MAX_STEPS_KEYS: [&str; 2] = ["agent.max_steps", "max_steps"];
const STEP_TIMEOUT_KEYS: [&str; 2] = ["agent.step_timeout_ms", "step_timeout_ms"];
const TASK_TIMEOUT_KEYS: [&str; 2] = ["agent.task_timeout_ms", "task_timeout_ms"];

/// Bounds applied to one task.
///
/// Each limit resolves from task metadata, then the task type's overrides,
/// then the environment, then the agent settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLimits {
    pub max_steps: usize,
    pub step_timeout: Duration,
    pub task_timeout: Duration,
}

impl TaskLimits {
    pub fn resolve(task: &TaskRequest, settings: &AgentSettings) -> Self {
        Self::resolve_with(task, settings, &|name| std::env::var(name).ok())
    }

    pub fn resolve_with(
        task: &TaskRequest,
        settings: &AgentSettings,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Self {
        let task_type = task
            .task_type
            .as_deref()
            .and_then(|task_type| settings.task_types.get(task_type))
            .cloned()
            .unwrap_or_default();

        let max_steps = parse_limit(
            &task.metadata,
            &MAX_STEPS_KEYS,
            task_type.max_steps.map(|v| v as u64),
            lookup(MAX_STEPS_ENV),
            settings.max_steps as u64,
        );
        let step_timeout_ms = parse_limit(
            &task.metadata,
            &STEP_TIMEOUT_KEYS,
            task_type.step_timeout_ms,
            lookup(STEP_TIMEOUT_ENV),
            settings.step_timeout_ms,
        );
        let task_timeout_ms = parse_limit(
            &task.metadata,
            &TASK_TIMEOUT_KEYS,
            task_type.task_timeout_ms,
            lookup(TASK_TIMEOUT_ENV),
            settings.task_timeout_ms,
        );

        Self {
            max_steps: max_steps as usize,
            step_timeout: Duration::from_millis(step_timeout_ms),
            task_timeout: Duration::from_millis(task_timeout_ms),
        }
    }
}

fn parse_limit(
    metadata: &HashMap<String, String>,
    keys: &[&str],
    task_type: Option<u64>,
    env_value: Option<String>,
    default: u64,
) -> u64 {
    for key in keys {
        if let Some(parsed) = metadata.get(*key).and_then(|v| parse_positive(v)) {
            return parsed;
        }
    }
    if let Some(value) = task_type.filter(|v| *v > 0) {
        return value;
    }
    if let Some(parsed) = env_value.as_deref().and_then(parse_positive) {
        return parsed;
    }
    default.max(1)
}

fn parse_positive(value: &str) -> Option<u64> {
    let parsed = value.trim().parse::<u64>().ok()?;
    if parsed == 0 {
        None
    } else {
        Some(parsed)
    }
}
