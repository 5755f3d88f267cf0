//! Transport channel: one connection to one tool server.
//!
//! A channel owns the transport, lazily (re)establishes sessions, and turns
//! every call into a [`ToolCallResult`] under a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use super::schema::{parse_catalog, ToolDescriptor};
use super::transport::{transport_for, MCPSession, MCPTransport, RawToolResult};
use crate::config::{ServerConfig, TransportKind};
use crate::error::{Result, ToolMeshError};
use crate::util::timeout::{with_deadline, Deadline};

/// How a single tool call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    Success { payload: Value },
    Timeout { after_ms: u64 },
    TransportError { message: String },
    ToolError { message: String },
}

/// Result of one tool call, produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Name the call was made with (the exposed name once routed).
    pub tool_name: String,
    pub server_id: String,
    #[serde(flatten)]
    pub outcome: ToolCallOutcome,
    pub elapsed_ms: u64,
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolCallOutcome::Success { .. })
    }

    /// Payload rendered as text, or the failure detail.
    pub fn payload_text(&self) -> String {
        match &self.outcome {
            ToolCallOutcome::Success { payload: Value::String(text) } => text.clone(),
            ToolCallOutcome::Success { payload } => payload.to_string(),
            ToolCallOutcome::Timeout { after_ms } => format!("timed out after {after_ms}ms"),
            ToolCallOutcome::TransportError { message } => format!("transport error: {message}"),
            ToolCallOutcome::ToolError { message } => format!("tool error: {message}"),
        }
    }
}

/// Channel operations the multi-server client depends on.
#[async_trait]
pub trait ToolChannel: Send + Sync {
    fn server_id(&self) -> &str;

    fn transport_kind(&self) -> TransportKind;

    /// Fetch and parse the server's current catalog.
    async fn list_tools(&self, deadline: Deadline) -> Result<Vec<ToolDescriptor>>;

    /// Invoke a tool. Failures are reported in the returned outcome.
    async fn call(&self, tool_name: &str, arguments: Value, deadline: Deadline) -> ToolCallResult;

    /// Release the connection before `deadline`. Idempotent.
    async fn close(&self, deadline: Deadline) -> Result<()>;
}

/// Channel backed by an [`MCPTransport`].
pub struct MCPChannel {
    config: ServerConfig,
    transport: Box<dyn MCPTransport>,
    session: Mutex<Option<Arc<dyn MCPSession>>>,
    call_gate: Mutex<()>,
    needs_recycle: AtomicBool,
    closed: AtomicBool,
}

/// Marks the channel desynchronized if dropped before `finish`.
struct InFlight<'a> {
    needs_recycle: &'a AtomicBool,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(needs_recycle: &'a AtomicBool, armed: bool) -> Self {
        Self { needs_recycle, armed }
    }

    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.needs_recycle.store(true, Ordering::SeqCst);
        }
    }
}

impl MCPChannel {
    /// Validate `config`, build its transport and connect before `deadline`.
    pub async fn open(config: ServerConfig, deadline: Deadline) -> Result<Self> {
        config.validate()?;
        let transport = transport_for(&config)?;
        Self::open_with_transport(config, transport, deadline).await
    }

    pub async fn open_with_transport(
        config: ServerConfig,
        transport: Box<dyn MCPTransport>,
        deadline: Deadline,
    ) -> Result<Self> {
        let channel = Self {
            config,
            transport,
            session: Mutex::new(None),
            call_gate: Mutex::new(()),
            needs_recycle: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        let deadline = channel.bounded(deadline);
        let started = Instant::now();

        channel.session(deadline).await.map_err(|error| match error {
            ToolMeshError::Connection { .. } => error,
            ToolMeshError::Timeout(ms) => ToolMeshError::connection(
                &channel.config.id,
                format!("initialize timed out after {ms}ms"),
            ),
            other => ToolMeshError::connection(&channel.config.id, other.to_string()),
        })?;

        tracing::info!(
            server = %channel.config.id,
            transport = %channel.transport.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "channel open"
        );
        Ok(channel)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn serialized(&self) -> bool {
        !self.transport.supports_concurrent_requests()
    }

    fn bounded(&self, deadline: Deadline) -> Deadline {
        deadline.capped(self.config.timeout())
    }

    async fn acquire_gate(&self, deadline: Deadline) -> Result<Option<MutexGuard<'_, ()>>> {
        if !self.serialized() {
            return Ok(None);
        }
        let budget_ms = deadline.remaining_ms();
        match tokio::time::timeout_at(deadline.instant(), self.call_gate.lock()).await {
            Ok(guard) => Ok(Some(guard)),
            Err(_) => Err(ToolMeshError::Timeout(budget_ms)),
        }
    }

    /// Current session, reconnecting when closed or marked for recycling.
    async fn session(&self, deadline: Deadline) -> Result<Arc<dyn MCPSession>> {
        with_deadline(deadline, async {
            let mut slot = self.session.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(ToolMeshError::InvalidState(format!(
                    "channel '{}' is closed",
                    self.config.id
                )));
            }

            let recycle = self.needs_recycle.swap(false, Ordering::SeqCst);
            if let Some(existing) = slot.as_ref() {
                if !recycle && !existing.is_closed() {
                    return Ok(Arc::clone(existing));
                }
            }

            if let Some(stale) = slot.take() {
                tracing::info!(server = %self.config.id, "recycling channel");
                if let Err(error) = stale.close().await {
                    tracing::debug!(server = %self.config.id, error = %error, "closing stale session failed");
                }
            }

            let session: Arc<dyn MCPSession> = Arc::from(self.transport.connect().await?);
            *slot = Some(Arc::clone(&session));
            Ok(session)
        })
        .await
    }

    fn note_failure(&self, error: &ToolMeshError) {
        if self.serialized()
            && matches!(error, ToolMeshError::Timeout(_) | ToolMeshError::Transport { .. })
        {
            self.needs_recycle.store(true, Ordering::SeqCst);
        }
    }

    async fn list_raw(&self, deadline: Deadline) -> Result<Value> {
        let _gate = self.acquire_gate(deadline).await?;
        let session = self.session(deadline).await?;
        let in_flight = InFlight::new(&self.needs_recycle, self.serialized());
        let result = with_deadline(deadline, session.list_tools()).await;
        in_flight.finish();
        if let Err(error) = &result {
            self.note_failure(error);
        }
        result
    }

    async fn call_raw(
        &self,
        tool_name: &str,
        arguments: Option<JsonObject>,
        deadline: Deadline,
    ) -> Result<RawToolResult> {
        let _gate = self.acquire_gate(deadline).await?;
        let session = self.session(deadline).await?;
        let in_flight = InFlight::new(&self.needs_recycle, self.serialized());
        let result = with_deadline(deadline, session.call_tool(tool_name, arguments)).await;
        in_flight.finish();
        if let Err(error) = &result {
            self.note_failure(error);
        }
        result
    }
}

#[async_trait]
impl ToolChannel for MCPChannel {
    fn server_id(&self) -> &str {
        &self.config.id
    }

    fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    async fn list_tools(&self, deadline: Deadline) -> Result<Vec<ToolDescriptor>> {
        let deadline = self.bounded(deadline);
        let raw = match self.list_raw(deadline).await {
            Err(error @ ToolMeshError::Transport { .. }) if !deadline.is_expired() => {
                tracing::warn!(server = %self.config.id, error = %error, "catalog fetch failed, reconnecting");
                self.needs_recycle.store(true, Ordering::SeqCst);
                self.list_raw(deadline).await?
            }
            other => other?,
        };
        let tools = parse_catalog(&self.config.id, &raw)?;
        tracing::debug!(server = %self.config.id, tools = tools.len(), "catalog fetched");
        Ok(tools)
    }

    async fn call(&self, tool_name: &str, arguments: Value, deadline: Deadline) -> ToolCallResult {
        let started = Instant::now();
        let deadline = self.bounded(deadline);

        let outcome = match coerce_tool_arguments(arguments) {
            Err(error) => ToolCallOutcome::ToolError {
                message: error.to_string(),
            },
            Ok(arguments) => match self.call_raw(tool_name, arguments, deadline).await {
                Ok(raw) => map_call_result(raw),
                Err(error) => outcome_from_error(error),
            },
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            ToolCallOutcome::Success { .. } => {
                tracing::debug!(server = %self.config.id, tool = %tool_name, elapsed_ms, "tool call succeeded")
            }
            failure => {
                tracing::warn!(server = %self.config.id, tool = %tool_name, elapsed_ms, outcome = ?failure, "tool call failed")
            }
        }

        ToolCallResult {
            tool_name: tool_name.to_owned(),
            server_id: self.config.id.clone(),
            outcome,
            elapsed_ms,
        }
    }

    async fn close(&self, deadline: Deadline) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        with_deadline(deadline, async {
            let session = self.session.lock().await.take();
            match session {
                Some(session) => session.close().await,
                None => Ok(()),
            }
        })
        .await
    }
}

fn coerce_tool_arguments(value: Value) -> Result<Option<JsonObject>> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed: Value = serde_json::from_str(trimmed).map_err(|e| {
                ToolMeshError::InvalidArgument(format!("tool arguments must be valid JSON: {e}"))
            })?;
            coerce_tool_arguments(parsed)
        }
        other => Err(ToolMeshError::InvalidArgument(format!(
            "tool arguments must be a JSON object; got {other}"
        ))),
    }
}

fn map_call_result(raw: RawToolResult) -> ToolCallOutcome {
    if raw.is_error {
        return ToolCallOutcome::ToolError {
            message: raw
                .text()
                .unwrap_or_else(|| "tool reported an error".to_owned()),
        };
    }
    let text = raw.text();
    let payload = match (raw.structured_content, text) {
        (Some(structured), _) => structured,
        (None, Some(text)) => Value::String(text),
        (None, None) => Value::Array(raw.content),
    };
    ToolCallOutcome::Success { payload }
}

fn outcome_from_error(error: ToolMeshError) -> ToolCallOutcome {
    match error {
        ToolMeshError::Timeout(after_ms) => ToolCallOutcome::Timeout { after_ms },
        ToolMeshError::ToolExecution { message, .. } | ToolMeshError::InvalidArgument(message) => {
            ToolCallOutcome::ToolError { message }
        }
        other => ToolCallOutcome::TransportError {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::test_support::{CallBehavior, ListBehavior, MockTransport};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    async fn open(transport: MockTransport) -> MCPChannel {
        let config = ServerConfig::subprocess(transport.server_id.clone(), "mock", Vec::<String>::new());
        MCPChannel::open_with_transport(config, Box::new(transport), Deadline::after_ms(1_000))
            .await
            .expect("channel should open")
    }

    #[test]
    fn coerce_tool_arguments_accepts_object_and_stringified_object() {
        let from_obj = coerce_tool_arguments(json!({"city": "Pune"}))
            .expect("object arguments should parse")
            .expect("object should be present");
        assert_eq!(from_obj.get("city"), Some(&json!("Pune")));

        let from_str = coerce_tool_arguments(json!(r#"{"a": 4}"#))
            .expect("stringified object should parse")
            .expect("object should be present");
        assert_eq!(from_str.get("a"), Some(&json!(4)));
        assert!(coerce_tool_arguments(Value::Null).expect("null").is_none());
    }

    #[test]
    fn coerce_tool_arguments_rejects_non_object() {
        let err = coerce_tool_arguments(json!(["bad"])).expect_err("array arguments should be rejected");
        assert!(matches!(err, ToolMeshError::InvalidArgument(_)));
    }

    #[test]
    fn map_call_result_prefers_structured_then_text() {
        let structured = map_call_result(RawToolResult::from_value(json!({
            "content": [{ "type": "text", "text": "40" }],
            "structuredContent": { "result": 40 }
        })));
        assert_eq!(structured, ToolCallOutcome::Success { payload: json!({ "result": 40 }) });

        let text = map_call_result(RawToolResult::from_value(json!({
            "content": [{ "type": "text", "text": "40" }]
        })));
        assert_eq!(text, ToolCallOutcome::Success { payload: json!("40") });

        let failed = map_call_result(RawToolResult::from_value(json!({
            "content": [{ "type": "text", "text": "division by zero" }],
            "isError": true
        })));
        assert_eq!(failed, ToolCallOutcome::ToolError { message: "division by zero".into() });
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let result = ToolCallResult {
            tool_name: "add".into(),
            server_id: "math".into(),
            outcome: ToolCallOutcome::Timeout { after_ms: 50 },
            elapsed_ms: 51,
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["status"], "timeout");
        assert_eq!(value["after_ms"], 50);
        assert_eq!(value["server_id"], "math");
    }

    #[tokio::test]
    async fn open_failure_is_a_connection_error() {
        let config = ServerConfig::subprocess("math", "mock", Vec::<String>::new());
        let transport = MockTransport::with_tools("math", &["add"]).failing_connect();
        let err = MCPChannel::open_with_transport(config, Box::new(transport), Deadline::after_ms(100))
            .await
            .err()
            .expect("connect failure");
        assert!(matches!(err, ToolMeshError::Connection { ref server, .. } if server == "math"));
    }

    #[tokio::test(start_paused = true)]
    async fn open_respects_deadline() {
        let config = ServerConfig::subprocess("slow", "mock", Vec::<String>::new());
        let transport = MockTransport::with_tools("slow", &[]).connect_delay(Duration::from_secs(60));
        let started = Instant::now();
        let err = MCPChannel::open_with_transport(config, Box::new(transport), Deadline::after_ms(200))
            .await
            .err()
            .expect("slow connect must time out");
        assert!(matches!(err, ToolMeshError::Connection { .. }));
        assert!(started.elapsed() <= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn list_tools_parses_catalog() {
        let channel = open(MockTransport::with_tools("math", &["add", "multiply"])).await;
        let tools = channel.list_tools(Deadline::after_ms(1_000)).await.expect("list");
        let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(names, vec!["add", "multiply"]);
        assert!(tools.iter().all(|tool| tool.server_id == "math"));
    }

    #[tokio::test]
    async fn empty_catalog_is_valid() {
        let channel = open(MockTransport::new("empty", json!({ "tools": [] }))).await;
        assert!(channel.list_tools(Deadline::after_ms(1_000)).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn malformed_catalog_is_a_schema_error() {
        let channel = open(MockTransport::new("bad", json!({ "tools": [{ "description": "nameless" }] }))).await;
        let err = channel
            .list_tools(Deadline::after_ms(1_000))
            .await
            .expect_err("nameless tool must fail");
        assert!(matches!(err, ToolMeshError::Schema { .. }));
    }

    #[tokio::test]
    async fn call_reports_success_payload() {
        let channel = open(MockTransport::with_tools("math", &["add"]).call(CallBehavior::Text("40".into()))).await;
        let result = channel
            .call("add", json!({ "a": 20, "b": 20 }), Deadline::after_ms(1_000))
            .await;
        assert_eq!(result.outcome, ToolCallOutcome::Success { payload: json!("40") });
        assert_eq!(result.server_id, "math");
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_server() {
        let transport = MockTransport::with_tools("math", &["add"]);
        let counters = transport.counters();
        let channel = open(transport).await;
        let result = channel.call("add", json!([1, 2]), Deadline::after_ms(1_000)).await;
        assert!(matches!(result.outcome, ToolCallOutcome::ToolError { .. }));
        assert_eq!(counters.calls(), 0);
    }

    #[tokio::test]
    async fn rpc_error_is_a_tool_error() {
        let channel = open(MockTransport::with_tools("math", &["add"]).call(CallBehavior::RpcError("bad args".into()))).await;
        let result = channel.call("add", Value::Null, Deadline::after_ms(1_000)).await;
        assert_eq!(result.outcome, ToolCallOutcome::ToolError { message: "bad args".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_and_recycles_pipe() {
        let transport = MockTransport::with_tools("diag", &["sleep"]).call(CallBehavior::Hang);
        let counters = transport.counters();
        let channel = open(transport).await;

        let started = Instant::now();
        let result = channel.call("sleep", Value::Null, Deadline::after_ms(300)).await;
        assert!(matches!(result.outcome, ToolCallOutcome::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_millis(350));
        assert_eq!(counters.connects(), 1);

        channel.list_tools(Deadline::after_ms(1_000)).await.expect("list after recycle");
        assert_eq!(counters.connects(), 2);
        assert_eq!(counters.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_marks_pipe_for_recycle() {
        let transport = MockTransport::with_tools("diag", &["sleep"]).call(CallBehavior::Hang);
        let counters = transport.counters();
        let channel = open(transport).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            channel.call("sleep", Value::Null, Deadline::after_ms(10_000)),
        )
        .await;
        assert!(abandoned.is_err());

        channel.list_tools(Deadline::after_ms(1_000)).await.expect("list after abandon");
        assert_eq!(counters.connects(), 2);
    }

    #[tokio::test]
    async fn dropped_connection_is_a_transport_error_then_reconnects() {
        let transport = MockTransport::with_tools("math", &["add"]).call(CallBehavior::Disconnect);
        let counters = transport.counters();
        let channel = open(transport).await;

        let result = channel.call("add", Value::Null, Deadline::after_ms(1_000)).await;
        assert!(matches!(result.outcome, ToolCallOutcome::TransportError { .. }));

        channel.list_tools(Deadline::after_ms(1_000)).await.expect("list after reconnect");
        assert_eq!(counters.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_timeout_override_caps_deadline() {
        let config = ServerConfig::subprocess("diag", "mock", Vec::<String>::new()).with_timeout_ms(100);
        let transport = MockTransport::with_tools("diag", &["sleep"]).call(CallBehavior::Sleep(Duration::from_secs(5)));
        let channel = MCPChannel::open_with_transport(config, Box::new(transport), Deadline::after_ms(1_000))
            .await
            .expect("open");

        let started = Instant::now();
        let result = channel.call("sleep", Value::Null, Deadline::after_ms(10_000)).await;
        assert!(matches!(result.outcome, ToolCallOutcome::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn pipe_calls_are_serialized_and_http_calls_overlap() {
        let sleep = CallBehavior::Sleep(Duration::from_millis(100));

        let pipe = open(MockTransport::with_tools("pipe", &["sleep"]).call(sleep.clone())).await;
        let started = Instant::now();
        futures::future::join(
            pipe.call("sleep", Value::Null, Deadline::after_ms(1_000)),
            pipe.call("sleep", Value::Null, Deadline::after_ms(1_000)),
        )
        .await;
        assert!(started.elapsed() >= Duration::from_millis(200));

        let http = open(MockTransport::with_tools("http", &["sleep"]).call(sleep).concurrent()).await;
        let started = Instant::now();
        futures::future::join(
            http.call("sleep", Value::Null, Deadline::after_ms(1_000)),
            http.call("sleep", Value::Null, Deadline::after_ms(1_000)),
        )
        .await;
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_use() {
        let transport = MockTransport::with_tools("math", &["add"]).list(ListBehavior::Catalog(json!([])));
        let counters = transport.counters();
        let channel = open(transport).await;

        channel.close(Deadline::after_ms(100)).await.expect("first close");
        channel.close(Deadline::after_ms(100)).await.expect("second close");
        assert_eq!(counters.closes(), 1);

        let result = channel.call("add", Value::Null, Deadline::after_ms(100)).await;
        assert!(matches!(result.outcome, ToolCallOutcome::TransportError { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_close_gives_up_at_deadline() {
        let channel = open(MockTransport::with_tools("math", &["add"]).hanging_close()).await;

        let started = Instant::now();
        let err = channel
            .close(Deadline::after_ms(200))
            .await
            .expect_err("hung close must time out");
        assert!(matches!(err, ToolMeshError::Timeout(200)));
        assert!(started.elapsed() <= Duration::from_millis(250));
        channel.close(Deadline::after_ms(200)).await.expect("already closed");
    }
}
