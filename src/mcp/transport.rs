//! MCP transport layer.
//!
//! A transport knows how to reach one server and produces [`MCPSession`]s;
//! everything above this layer is transport-agnostic.

use async_trait::async_trait;
use rmcp::model::JsonObject;
use serde_json::Value;

use crate::config::{ServerConfig, TransportConfig, TransportKind};
use crate::error::Result;

mod http;
mod stdio;

pub use http::HttpStreamTransport;
pub use stdio::StdioTransport;

#[cfg(test)]
pub(crate) mod test_support;

/// Tool result normalized from the wire shape `{content, structuredContent, isError}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawToolResult {
    pub content: Vec<Value>,
    pub structured_content: Option<Value>,
    pub is_error: bool,
}

impl RawToolResult {
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self {
                content: Vec::new(),
                structured_content: Some(value),
                is_error: false,
            };
        };
        let content = match fields.remove("content") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        let structured_content = fields
            .remove("structuredContent")
            .filter(|value| !value.is_null());
        let is_error = fields
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            content,
            structured_content,
            is_error,
        }
    }

    /// Join every text (or text resource) content item.
    pub fn text(&self) -> Option<String> {
        let lines: Vec<&str> = self
            .content
            .iter()
            .filter_map(|item| match item.get("type").and_then(Value::as_str) {
                Some("text") => item.get("text").and_then(Value::as_str),
                Some("resource") => item
                    .get("resource")
                    .and_then(|resource| resource.get("text"))
                    .and_then(Value::as_str),
                _ => None,
            })
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// An established protocol session with one server.
#[async_trait]
pub trait MCPSession: Send + Sync {
    /// Fetch the full catalog as a raw `{"tools": [...]}` value.
    async fn list_tools(&self) -> Result<Value>;

    /// Invoke a tool. A JSON-RPC error reply maps to `ToolMeshError::ToolExecution`.
    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<RawToolResult>;

    /// Whether the underlying process or connection is gone.
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Transport trait: opens sessions to a single server.
#[async_trait]
pub trait MCPTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether one session accepts overlapping requests.
    fn supports_concurrent_requests(&self) -> bool;

    /// Spawn or connect, then complete the initialize handshake.
    async fn connect(&self) -> Result<Box<dyn MCPSession>>;
}

/// Build the transport variant selected by `config`.
pub fn transport_for(config: &ServerConfig) -> Result<Box<dyn MCPTransport>> {
    match &config.transport {
        TransportConfig::Subprocess {
            command,
            args,
            env,
            cwd,
        } => Ok(Box::new(
            StdioTransport::new(&config.id, command, args.clone())
                .with_env(env.clone())
                .with_cwd(cwd.clone()),
        )),
        TransportConfig::HttpStream { url, headers } => Ok(Box::new(HttpStreamTransport::new(
            &config.id, url, headers,
        )?)),
    }
}
