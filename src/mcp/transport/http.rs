//! Streamable HTTP transport: JSON-RPC over POST, replies as JSON or SSE.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use rmcp::model::{JsonObject, ProtocolVersion};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{MCPSession, MCPTransport, RawToolResult};
use crate::config::TransportKind;
use crate::error::{Result, ToolMeshError};

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";
const STREAM_ACCEPT: &str = "application/json, text/event-stream";
const MAX_CATALOG_PAGES: usize = 64;

/// HTTP-stream transport for remote tool servers.
pub struct HttpStreamTransport {
    server_id: String,
    url: String,
    client: reqwest::Client,
}

impl HttpStreamTransport {
    /// Build a transport; `headers` are sent on every request.
    pub fn new(server_id: &str, url: &str, headers: &BTreeMap<String, String>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ToolMeshError::Configuration(format!("server '{server_id}': invalid header name '{name}'"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| {
                ToolMeshError::Configuration(format!(
                    "server '{server_id}': invalid value for header '{name}'"
                ))
            })?;
            default_headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            server_id: server_id.to_owned(),
            url: url.to_owned(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MCPTransport for HttpStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpStream
    }

    fn supports_concurrent_requests(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<Box<dyn MCPSession>> {
        tracing::debug!(server = %self.server_id, url = %self.url, "connecting http-stream tool server");
        let session = HttpSession {
            server_id: self.server_id.clone(),
            url: self.url.clone(),
            client: self.client.clone(),
            session_id: StdMutex::new(None),
            protocol_version: StdMutex::new(None),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        session.initialize().await?;
        Ok(Box::new(session))
    }
}

/// JSON-RPC error object carried in a reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcErrorObject {
    fn describe(&self) -> String {
        match &self.data {
            Some(data) => format!("JSON-RPC error {}: {} ({data})", self.code, self.message),
            None => format!("JSON-RPC error {}: {}", self.code, self.message),
        }
    }

    fn is_protocol_version_mismatch(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        message.contains("protocol") && message.contains("version")
    }
}

type RpcReply = std::result::Result<Value, RpcErrorObject>;

struct HttpSession {
    server_id: String,
    url: String,
    client: reqwest::Client,
    session_id: StdMutex<Option<String>>,
    protocol_version: StdMutex<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpSession {
    async fn initialize(&self) -> Result<()> {
        let reply = match self.send_initialize(ProtocolVersion::LATEST).await? {
            Err(error) if error.is_protocol_version_mismatch() => {
                tracing::debug!(
                    server = %self.server_id,
                    error = %error.message,
                    "retrying initialize with legacy protocol version"
                );
                self.send_initialize(ProtocolVersion::V_2024_11_05).await?
            }
            other => other,
        };
        let result = reply.map_err(|error| {
            ToolMeshError::connection(&self.server_id, format!("initialize rejected: {}", error.describe()))
        })?;

        let negotiated = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_owned);
        *lock(&self.protocol_version) = negotiated;

        self.notify("notifications/initialized").await?;
        tracing::debug!(
            server = %self.server_id,
            session = ?lock(&self.session_id).as_deref(),
            "http-stream session initialized"
        );
        Ok(())
    }

    async fn send_initialize(&self, version: ProtocolVersion) -> Result<RpcReply> {
        let params = json!({
            "protocolVersion": serde_json::to_value(&version)?,
            "capabilities": {},
            "clientInfo": { "name": "toolmesh", "version": env!("CARGO_PKG_VERSION") },
        });
        self.request("initialize", params).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<RpcReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self.post(&body).await?;

        if response.status() == StatusCode::ACCEPTED {
            return Err(ToolMeshError::protocol(
                &self.server_id,
                format!("{method}: server accepted the request without a reply"),
            ));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        if is_stream {
            self.read_stream_reply(response, id, method).await
        } else {
            let message: Value = response.json().await.map_err(|error| {
                ToolMeshError::protocol(&self.server_id, format!("{method}: invalid JSON reply: {error}"))
            })?;
            find_reply(&message, id).ok_or_else(|| {
                ToolMeshError::protocol(&self.server_id, format!("{method}: reply did not carry id {id}"))
            })
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        self.post(&body).await.map(|_| ())
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolMeshError::transport(&self.server_id, "session is closed"));
        }

        let session_id = lock(&self.session_id).clone();
        let protocol_version = lock(&self.protocol_version).clone();

        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, STREAM_ACCEPT)
            .json(body);
        if let Some(session_id) = &session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        if let Some(version) = &protocol_version {
            request = request.header(PROTOCOL_HEADER, version);
        }

        let response = request.send().await.map_err(|error| {
            self.closed.store(true, Ordering::SeqCst);
            ToolMeshError::transport(&self.server_id, format!("request failed: {error}"))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && session_id.is_some() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(ToolMeshError::transport(&self.server_id, "session expired"));
        }
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(ToolMeshError::transport(
                &self.server_id,
                format!("HTTP {status}: {text}"),
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ToolMeshError::protocol(
                &self.server_id,
                format!("HTTP {status}: {text}"),
            ));
        }

        if session_id.is_none() {
            if let Some(assigned) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
            {
                *lock(&self.session_id) = Some(assigned.to_owned());
            }
        }
        Ok(response)
    }

    async fn read_stream_reply(&self, response: reqwest::Response, id: u64, method: &str) -> Result<RpcReply> {
        let mut byte_stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|error| {
                ToolMeshError::transport(&self.server_id, format!("{method}: stream failed: {error}"))
            })?;
            for data in decoder.push(&chunk) {
                if let Some(reply) = self.match_event(&data, id) {
                    return Ok(reply);
                }
            }
        }
        if let Some(data) = decoder.finish() {
            if let Some(reply) = self.match_event(&data, id) {
                return Ok(reply);
            }
        }
        Err(ToolMeshError::transport(
            &self.server_id,
            format!("{method}: stream ended before reply"),
        ))
    }

    fn match_event(&self, data: &str, id: u64) -> Option<RpcReply> {
        match serde_json::from_str::<Value>(data) {
            Ok(message) => {
                let reply = find_reply(&message, id);
                if reply.is_none() {
                    tracing::trace!(server = %self.server_id, message = %data, "skipping server message");
                }
                reply
            }
            Err(error) => {
                tracing::debug!(server = %self.server_id, error = %error, "ignoring malformed SSE event");
                None
            }
        }
    }
}

#[async_trait]
impl MCPSession for HttpSession {
    async fn list_tools(&self) -> Result<Value> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_CATALOG_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page = self.request("tools/list", params).await?.map_err(|error| {
                ToolMeshError::protocol(&self.server_id, format!("tools/list: {}", error.describe()))
            })?;

            match page.get("tools") {
                Some(Value::Array(items)) => tools.extend(items.iter().cloned()),
                _ => return Ok(page),
            }
            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_owned);
            if cursor.is_none() {
                return Ok(json!({ "tools": tools }));
            }
        }

        Err(ToolMeshError::protocol(
            &self.server_id,
            format!("tools/list exceeded {MAX_CATALOG_PAGES} pages"),
        ))
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<RawToolResult> {
        let params = json!({ "name": name, "arguments": arguments.unwrap_or_default() });
        match self.request("tools/call", params).await? {
            Ok(result) => Ok(RawToolResult::from_value(result)),
            Err(error) => Err(ToolMeshError::ToolExecution {
                tool_name: name.to_owned(),
                message: error.describe(),
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session_id) = lock(&self.session_id).take() else {
            return Ok(());
        };
        if let Err(error) = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, &session_id)
            .send()
            .await
        {
            tracing::debug!(server = %self.server_id, error = %error, "session delete failed, ignoring");
        }
        Ok(())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Find the reply to request `id` in a single message or a batch.
fn find_reply(message: &Value, id: u64) -> Option<RpcReply> {
    if let Value::Array(batch) = message {
        return batch.iter().find_map(|item| find_reply(item, id));
    }
    let matches = match message.get("id") {
        Some(Value::Number(n)) => n.as_u64() == Some(id),
        Some(Value::String(s)) => s.parse::<u64>().ok() == Some(id),
        _ => false,
    };
    if !matches {
        return None;
    }
    if let Some(error) = message.get("error") {
        let error = serde_json::from_value::<RpcErrorObject>(error.clone()).unwrap_or_else(|_| RpcErrorObject {
            code: -32603,
            message: error.to_string(),
            data: None,
        });
        return Some(Err(error));
    }
    Some(Ok(message.get("result").cloned().unwrap_or(Value::Null)))
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Buffers raw bytes and decodes only complete lines, so a UTF-8 sequence
/// split across chunks is reassembled. Only `data:` fields are kept;
/// multi-line data is joined with `\n`.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk, returning the data of every event it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.pending_data.is_empty() {
                    events.push(self.pending_data.join("\n"));
                    self.pending_data.clear();
                }
                continue;
            }
            self.push_field(line);
        }
        events
    }

    fn push_field(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("data:") {
            self.pending_data
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_owned());
        }
    }

    /// Flush an event left unterminated at end of stream.
    fn finish(&mut self) -> Option<String> {
        let trailing = std::mem::take(&mut self.buffer);
        let trailing = String::from_utf8_lossy(&trailing);
        self.push_field(trailing.trim_end_matches('\r'));
        if self.pending_data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending_data).join("\n"))
        }
    }
}
