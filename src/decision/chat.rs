//! Decision-maker backed by an OpenAI-compatible chat-completions API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Decision, DecisionMaker};
use crate::agent_loop::types::{SessionState, TaskRequest};
use crate::config::DecisionConfig;
use crate::error::{Result, ToolMeshError};
use crate::mcp::aggregate::MergedCatalog;
use crate::util::retry::RetryPolicy;
use crate::util::timeout::Deadline;

const DEFAULT_SYSTEM_PROMPT: &str = "You complete tasks by calling the provided tools. \
Call one tool at a time. When the task is done, reply with the final answer as plain text.";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Asks a chat model for the next step, one request per decision.
pub struct ChatDecisionMaker {
    config: DecisionConfig,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl ChatDecisionMaker {
    pub fn new(config: DecisionConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            config,
            api_key: api_key.into(),
            client,
            retry: RetryPolicy::default(),
        })
    }

    /// Build from config, reading the API key from its environment variable.
    pub fn from_config(config: &DecisionConfig) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        Self::new(config.clone(), api_key)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn build_request_body(
        &self,
        task: &TaskRequest,
        catalog: &MergedCatalog,
        session: &SessionState,
    ) -> Value {
        let system = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let mut messages = vec![
            json!({ "role": "system", "content": system }),
            json!({ "role": "user", "content": task.description }),
        ];

        for step in session.steps() {
            messages.push(json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": step.request.call_id,
                    "type": "function",
                    "function": {
                        "name": step.request.tool_name,
                        "arguments": step.request.arguments.to_string(),
                    }
                }],
            }));
            messages.push(json!({
                "role": "tool",
                "tool_call_id": step.request.call_id,
                "content": step.result.payload_text(),
            }));
        }

        let tools: Vec<Value> = catalog
            .tools()
            .map(|entry| {
                json!({
                    "type": "function",
                    "function": {
                        "name": entry.exposed_name,
                        "description": entry.descriptor.description,
                        "parameters": entry.descriptor.input_schema,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0,
        });
        if !tools.is_empty() {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("tools".into(), tools.into());
                obj.insert("tool_choice".into(), "auto".into());
            }
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => ToolMeshError::Authentication(body_text),
                _ => ToolMeshError::api(status, body_text),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl DecisionMaker for ChatDecisionMaker {
    async fn decide(
        &self,
        task: &TaskRequest,
        catalog: &MergedCatalog,
        session: &SessionState,
    ) -> Result<Decision> {
        let body = self.build_request_body(task, catalog, session);
        debug!(
            model = %self.config.model,
            tools = catalog.len(),
            steps = session.len(),
            "requesting decision"
        );

        let response = self
            .retry
            .execute_until(Deadline::after(REQUEST_TIMEOUT), || self.send(&body))
            .await?;
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| ToolMeshError::DecisionMaker("no choices in response".into()))?;
        decision_from_message(message)
    }
}

fn decision_from_message(message: ChatMessage) -> Result<Decision> {
    if let Some(call) = message.tool_calls.unwrap_or_default().into_iter().next() {
        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::String(call.function.arguments))
        };
        return Ok(Decision::CallTool {
            call_id: call.id,
            tool_name: call.function.name,
            arguments,
        });
    }
    match message.content {
        Some(content) if !content.trim().is_empty() => Ok(Decision::finish(content)),
        _ => Err(ToolMeshError::DecisionMaker(
            "response had neither a tool call nor an answer".into(),
        )),
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    id: Option<String>,
    function: ChatFunction,
}

#[derive(Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}
