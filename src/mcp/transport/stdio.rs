use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, ClientInfo, JsonObject, ProtocolVersion};
use rmcp::service::{ClientInitializeError, DynService, Peer, RoleClient, RunningService, ServiceError, ServiceExt};
use rmcp::transport::TokioChildProcess;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{MCPSession, MCPTransport, RawToolResult};
use crate::config::TransportKind;
use crate::error::{Result, ToolMeshError};

pub type DynClientService = Box<dyn DynService<RoleClient>>;
pub type MCPRunningService = RunningService<RoleClient, DynClientService>;

/// Stdio-based MCP transport (for local MCP servers).
///
/// Each connect spawns a fresh child process; responses are framed one JSON
/// message per line, so requests on one pipe must not overlap.
pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl StdioTransport {
    pub fn new(server_id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            server_id: server_id.into(),
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.command);
        command.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }

    async fn serve(&self, client_info: ClientInfo) -> std::result::Result<MCPRunningService, ClientInitializeError> {
        let transport = TokioChildProcess::new(self.build_command()).map_err(|error| {
            ClientInitializeError::transport::<TokioChildProcess>(error, "spawn stdio transport")
        })?;
        client_info.into_dyn().serve(transport).await
    }
}

#[async_trait]
impl MCPTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Subprocess
    }

    fn supports_concurrent_requests(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<Box<dyn MCPSession>> {
        tracing::debug!(
            server = %self.server_id,
            command = %self.command,
            args = ?self.args,
            "spawning stdio tool server"
        );
        let service = connect_with_protocol_fallback(|info| self.serve(info))
            .await
            .map_err(|error| map_client_initialize_error(&self.server_id, error))?;
        Ok(Box::new(RmcpSession::new(&self.server_id, service)))
    }
}

/// Try the latest protocol version, then fall back to `2024-11-05` when the
/// server rejects the version.
pub(super) async fn connect_with_protocol_fallback<F, Fut>(
    mut connect: F,
) -> std::result::Result<MCPRunningService, ClientInitializeError>
where
    F: FnMut(ClientInfo) -> Fut,
    Fut: Future<Output = std::result::Result<MCPRunningService, ClientInitializeError>>,
{
    let latest_client_info = ClientInfo {
        protocol_version: ProtocolVersion::LATEST,
        ..Default::default()
    };

    match connect(latest_client_info).await {
        Ok(session) => return Ok(session),
        Err(error) if should_retry_protocol_fallback(&error) => {
            tracing::debug!(error = %error, "retrying initialize with legacy protocol version");
        }
        Err(error) => return Err(error),
    }

    let fallback_client_info = ClientInfo {
        protocol_version: ProtocolVersion::V_2024_11_05,
        ..Default::default()
    };
    connect(fallback_client_info).await
}

fn should_retry_protocol_fallback(error: &ClientInitializeError) -> bool {
    match error {
        ClientInitializeError::JsonRpcError(error) => {
            let message = error.message.to_ascii_lowercase();
            message.contains("protocol") && message.contains("version")
        }
        _ => false,
    }
}

/// Session backed by an rmcp running service.
pub(super) struct RmcpSession {
    server_id: String,
    peer: Peer<RoleClient>,
    service: StdMutex<Option<MCPRunningService>>,
}

impl RmcpSession {
    pub(super) fn new(server_id: &str, service: MCPRunningService) -> Self {
        Self {
            server_id: server_id.to_owned(),
            peer: service.peer().clone(),
            service: StdMutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl MCPSession for RmcpSession {
    async fn list_tools(&self) -> Result<Value> {
        let tools = match self.peer.list_all_tools().await {
            Ok(tools) => tools,
            Err(ServiceError::UnexpectedResponse) => self
                .peer
                .list_tools(None)
                .await
                .map(|page| page.tools)
                .map_err(|error| map_service_error(&self.server_id, "list_tools", error))?,
            Err(error) => return Err(map_service_error(&self.server_id, "list_tools", error)),
        };
        Ok(json!({ "tools": serde_json::to_value(tools)? }))
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<RawToolResult> {
        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_owned().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|error| match error {
                ServiceError::McpError(error) => ToolMeshError::ToolExecution {
                    tool_name: name.to_owned(),
                    message: format!("MCP error {}: {}", error.code.0, error.message),
                },
                other => map_service_error(&self.server_id, "call_tool", other),
            })?;
        Ok(RawToolResult::from_value(serde_json::to_value(result)?))
    }

    fn is_closed(&self) -> bool {
        let guard = self
            .service
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.as_ref().map_or(true, |service| service.is_closed())
    }

    async fn close(&self) -> Result<()> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(service) = service else {
            return Ok(());
        };
        service.cancel().await.map(|_| ()).map_err(|error| {
            ToolMeshError::transport(&self.server_id, format!("stdio shutdown failed: {error}"))
        })
    }
}

fn map_client_initialize_error(server_id: &str, error: ClientInitializeError) -> ToolMeshError {
    let message = match error {
        ClientInitializeError::ConnectionClosed(context) => {
            format!("connection closed during initialize: {context}")
        }
        ClientInitializeError::TransportError { error, context } => {
            format!("transport error during initialize ({context}): {error}")
        }
        ClientInitializeError::JsonRpcError(error) => {
            format!("initialize rejected: JSON-RPC error {}: {}", error.code.0, error.message)
        }
        ClientInitializeError::Cancelled => "initialize cancelled".to_owned(),
        other => format!("initialize failed: {other}"),
    };
    ToolMeshError::connection(server_id, message)
}

fn map_service_error(server_id: &str, context: &str, error: ServiceError) -> ToolMeshError {
    match error {
        ServiceError::McpError(error) => ToolMeshError::protocol(
            server_id,
            format!("{context}: MCP error {}: {}", error.code.0, error.message),
        ),
        ServiceError::TransportSend(error) => {
            ToolMeshError::transport(server_id, format!("{context}: send failed: {error}"))
        }
        ServiceError::TransportClosed => {
            ToolMeshError::transport(server_id, format!("{context}: server process closed the pipe"))
        }
        ServiceError::UnexpectedResponse => {
            ToolMeshError::protocol(server_id, format!("{context}: unexpected response"))
        }
        ServiceError::Cancelled { reason } => {
            let suffix = reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            ToolMeshError::transport(server_id, format!("{context}: request cancelled{suffix}"))
        }
        ServiceError::Timeout { timeout } => ToolMeshError::Timeout(timeout.as_millis() as u64),
        other => ToolMeshError::protocol(server_id, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::test_support::{scripted_running_service, ScriptedServer};
    use std::sync::{Arc, Mutex};

    #[test]
    fn stdio_constructor_keeps_command_and_args() {
        let transport = StdioTransport::new("math", "python", vec!["-u".into(), "mathserver.py".into()]);
        assert_eq!(transport.command(), "python");
        assert_eq!(transport.args(), &["-u".to_string(), "mathserver.py".to_string()]);
        assert!(!transport.supports_concurrent_requests());
    }

    #[tokio::test]
    async fn connect_reports_spawn_failure_as_connection_error() {
        let transport = StdioTransport::new("ghost", "/definitely/not/a/real/binary", Vec::new());
        let err = transport
            .connect()
            .await
            .err()
            .expect("missing binary should fail to spawn");
        assert!(matches!(err, ToolMeshError::Connection { ref server, .. } if server == "ghost"));
    }

    #[tokio::test]
    async fn session_lists_tools_as_raw_catalog() {
        let session = RmcpSession::new("math", scripted_running_service(ScriptedServer::default()));
        let raw = session.list_tools().await.expect("list should succeed");
        let names: Vec<_> = raw["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .filter_map(|tool| tool["name"].as_str())
            .collect();
        assert_eq!(names, vec!["add", "multiply"]);
    }

    #[tokio::test]
    async fn session_call_normalizes_result() {
        let session = RmcpSession::new("math", scripted_running_service(ScriptedServer::default()));
        let mut arguments = JsonObject::new();
        arguments.insert("a".into(), json!(4));
        arguments.insert("b".into(), json!(5));

        let result = session
            .call_tool("multiply", Some(arguments))
            .await
            .expect("call should succeed");
        assert_eq!(result.text().as_deref(), Some("20"));
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn session_maps_rpc_error_to_tool_execution() {
        let session = RmcpSession::new("math", scripted_running_service(ScriptedServer::default()));
        let err = session
            .call_tool("divide", None)
            .await
            .expect_err("unknown tool should be a JSON-RPC error");
        assert!(matches!(err, ToolMeshError::ToolExecution { ref tool_name, .. } if tool_name == "divide"));
    }

    #[tokio::test]
    async fn session_maps_dropped_pipe_to_transport_error() {
        let session = RmcpSession::new(
            "math",
            scripted_running_service(ScriptedServer {
                disconnect_on_call: true,
                ..Default::default()
            }),
        );
        let err = session
            .call_tool("add", None)
            .await
            .expect_err("disconnect should fail the call");
        assert!(matches!(err, ToolMeshError::Transport { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = RmcpSession::new("math", scripted_running_service(ScriptedServer::default()));
        session.close().await.expect("first close");
        session.close().await.expect("second close");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn protocol_fallback_retries_with_legacy_version() {
        let attempted = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&attempted);

        connect_with_protocol_fallback(|info| {
            let seen = Arc::clone(&seen);
            async move {
                let first = {
                    let mut seen = seen.lock().expect("protocol log lock");
                    seen.push(info.protocol_version.clone());
                    seen.len() == 1
                };
                if first {
                    Err(ClientInitializeError::JsonRpcError(
                        rmcp::model::ErrorData::invalid_request("unsupported protocol version", None),
                    ))
                } else {
                    Ok(scripted_running_service(ScriptedServer::default()))
                }
            }
        })
        .await
        .expect("fallback should connect");

        let attempted = attempted.lock().expect("protocol log lock");
        assert_eq!(
            attempted.as_slice(),
            &[ProtocolVersion::LATEST, ProtocolVersion::V_2024_11_05]
        );
    }

    #[tokio::test]
    async fn protocol_fallback_does_not_retry_other_errors() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let err = connect_with_protocol_fallback(|_| {
            let counter = Arc::clone(&counter);
            async move {
                *counter.lock().expect("counter lock") += 1;
                Err(ClientInitializeError::ConnectionClosed("eof".into()))
            }
        })
        .await
        .err()
        .expect("connection closed should not retry");
        assert!(matches!(err, ClientInitializeError::ConnectionClosed(_)));
        assert_eq!(*calls.lock().expect("counter lock"), 1);
    }
}
