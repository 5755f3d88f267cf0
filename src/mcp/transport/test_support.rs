use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rmcp::{
    model::{JsonObject, ServerJsonRpcMessage},
    service::{serve_directly, RoleClient, RxJsonRpcMessage, ServiceExt, TxJsonRpcMessage},
    transport::Transport as RmcpTransport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::stdio::MCPRunningService;
use super::{MCPSession, MCPTransport, RawToolResult};
use crate::config::TransportKind;
use crate::error::{Result, ToolMeshError};

struct ChannelRmcpTransport {
    outbound: UnboundedSender<TxJsonRpcMessage<RoleClient>>,
    inbound: UnboundedReceiver<RxJsonRpcMessage<RoleClient>>,
}

impl RmcpTransport<RoleClient> for ChannelRmcpTransport {
    type Error = io::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleClient>,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send + 'static {
        let tx = self.outbound.clone();
        async move {
            tx.send(item)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock rmcp channel closed"))
        }
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<RoleClient>> {
        self.inbound.recv().await
    }

    fn close(&mut self) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        self.inbound.close();
        std::future::ready(Ok(()))
    }
}

/// A tiny math server driven over in-memory channels.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedServer {
    pub disconnect_on_list: bool,
    pub disconnect_on_call: bool,
}

fn reply(id: Value, body: Value) -> ServerJsonRpcMessage {
    let mut message = json!({ "jsonrpc": "2.0", "id": id });
    if let (Some(message), Value::Object(body)) = (message.as_object_mut(), body) {
        message.extend(body);
    }
    serde_json::from_value(message).expect("mock response should deserialize")
}

fn number(arguments: &Value, key: &str) -> f64 {
    arguments.get(key).and_then(Value::as_f64).unwrap_or_default()
}

pub(crate) fn scripted_running_service(server: ScriptedServer) -> MCPRunningService {
    let (outbound_tx, mut outbound_rx) = unbounded_channel::<TxJsonRpcMessage<RoleClient>>();
    let (inbound_tx, inbound_rx) = unbounded_channel::<RxJsonRpcMessage<RoleClient>>();
    let transport = ChannelRmcpTransport {
        outbound: outbound_tx,
        inbound: inbound_rx,
    };

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(value) = serde_json::to_value(message) else {
                continue;
            };
            let Some(method) = value.get("method").and_then(Value::as_str) else {
                continue;
            };
            let id = value.get("id").cloned().unwrap_or(Value::Null);

            match method {
                "tools/list" if server.disconnect_on_list => return,
                "tools/call" if server.disconnect_on_call => return,
                "tools/list" => {
                    let _ = inbound_tx.send(reply(
                        id,
                        json!({ "result": {
                            "tools": [
                                { "name": "add", "description": "Add two numbers",
                                  "inputSchema": { "type": "object", "properties": {} } },
                                { "name": "multiply", "description": "Multiply two numbers",
                                  "inputSchema": { "type": "object", "properties": {} } }
                            ],
                            "nextCursor": null
                        }}),
                    ));
                }
                "tools/call" => {
                    let params = value.get("params").cloned().unwrap_or(Value::Null);
                    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                    let result = match params.get("name").and_then(Value::as_str) {
                        Some("add") => Some(number(&arguments, "a") + number(&arguments, "b")),
                        Some("multiply") => Some(number(&arguments, "a") * number(&arguments, "b")),
                        _ => None,
                    };
                    let body = match result {
                        Some(result) => json!({ "result": {
                            "content": [{ "type": "text", "text": format!("{result}") }],
                            "isError": false
                        }}),
                        None => json!({ "error": { "code": -32602, "message": "unknown tool" } }),
                    };
                    let _ = inbound_tx.send(reply(id, body));
                }
                _ => {}
            }
        }
    });

    serve_directly(().into_dyn(), transport, None)
}

#[derive(Debug, Clone)]
pub(crate) enum ListBehavior {
    Catalog(Value),
    /// One catalog per listing; the last one repeats.
    Sequence(Vec<Value>),
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) enum CallBehavior {
    /// Return the arguments as structured content.
    Echo,
    Text(String),
    RpcError(String),
    Disconnect,
    Hang,
    Sleep(Duration),
}

#[derive(Debug, Default)]
pub(crate) struct MockCounters {
    pub connects: AtomicUsize,
    pub lists: AtomicUsize,
    pub calls: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockCounters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// In-memory transport with scripted behaviour and shared counters.
#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    pub server_id: String,
    pub kind: TransportKind,
    pub concurrent: bool,
    pub connect_delay: Option<Duration>,
    pub fail_connect: bool,
    pub hang_close: bool,
    pub list: ListBehavior,
    pub call: CallBehavior,
    pub counters: Arc<MockCounters>,
}

impl MockTransport {
    pub fn new(server_id: &str, tools: Value) -> Self {
        Self {
            server_id: server_id.to_owned(),
            kind: TransportKind::Subprocess,
            concurrent: false,
            connect_delay: None,
            fail_connect: false,
            hang_close: false,
            list: ListBehavior::Catalog(tools),
            call: CallBehavior::Echo,
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// A server advertising the given tool names with empty object schemas.
    pub fn with_tools(server_id: &str, names: &[&str]) -> Self {
        let tools: Vec<Value> = names
            .iter()
            .map(|name| json!({ "name": name, "inputSchema": { "type": "object" } }))
            .collect();
        Self::new(server_id, json!({ "tools": tools }))
    }

    pub fn call(mut self, behavior: CallBehavior) -> Self {
        self.call = behavior;
        self
    }

    pub fn list(mut self, behavior: ListBehavior) -> Self {
        self.list = behavior;
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.kind = TransportKind::HttpStream;
        self.concurrent = true;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn hanging_close(mut self) -> Self {
        self.hang_close = true;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }
}

#[async_trait]
impl MCPTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_concurrent_requests(&self) -> bool {
        self.concurrent
    }

    async fn connect(&self) -> Result<Box<dyn MCPSession>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(ToolMeshError::connection(&self.server_id, "connection refused"));
        }
        Ok(Box::new(MockSession {
            transport: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    transport: MockTransport,
    closed: AtomicBool,
}

#[async_trait]
impl MCPSession for MockSession {
    async fn list_tools(&self) -> Result<Value> {
        let listed = self.transport.counters.lists.fetch_add(1, Ordering::SeqCst);
        match &self.transport.list {
            ListBehavior::Catalog(tools) => Ok(tools.clone()),
            ListBehavior::Sequence(catalogs) => catalogs
                .get(listed.min(catalogs.len().saturating_sub(1)))
                .cloned()
                .ok_or_else(|| ToolMeshError::protocol(&self.transport.server_id, "empty sequence")),
            ListBehavior::Fail(message) => Err(ToolMeshError::protocol(&self.transport.server_id, message)),
            ListBehavior::Hang => std::future::pending().await,
        }
    }

    async fn call_tool(&self, name: &str, arguments: Option<JsonObject>) -> Result<RawToolResult> {
        self.transport.counters.calls.fetch_add(1, Ordering::SeqCst);
        match &self.transport.call {
            CallBehavior::Echo => Ok(RawToolResult {
                content: Vec::new(),
                structured_content: Some(Value::Object(arguments.unwrap_or_default())),
                is_error: false,
            }),
            CallBehavior::Text(text) => Ok(RawToolResult::from_value(json!({
                "content": [{ "type": "text", "text": text }]
            }))),
            CallBehavior::RpcError(message) => Err(ToolMeshError::ToolExecution {
                tool_name: name.to_owned(),
                message: message.clone(),
            }),
            CallBehavior::Disconnect => {
                self.closed.store(true, Ordering::SeqCst);
                Err(ToolMeshError::transport(&self.transport.server_id, "connection reset"))
            }
            CallBehavior::Hang => std::future::pending().await,
            CallBehavior::Sleep(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(RawToolResult::from_value(json!({
                    "content": [{ "type": "text", "text": "slept" }]
                })))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.transport.hang_close {
            return std::future::pending().await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.transport.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
