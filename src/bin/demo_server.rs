//! Small MCP tool server for the integration tests and local CLI runs.
//!
//! Speaks newline-delimited JSON-RPC on stdio by default. With `--listen` it
//! serves streamable HTTP on `/mcp` instead, announcing the bound address on
//! stdout as `listening on http://<addr>/mcp`.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const WEATHER_REPORT: &str = "It's always rains in Pune";
const INVALID_PARAMS: i64 = -32602;
const METHOD_NOT_FOUND: i64 = -32601;
const PARSE_ERROR: i64 = -32700;
const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Parser, Debug)]
#[command(name = "toolmesh-demo-server", version, about = "Demo MCP tool server (stdio or HTTP)")]
struct Args {
    /// Comma-separated toolsets: math, weather, diagnostics
    #[arg(long, value_delimiter = ',', default_value = "math")]
    toolsets: Vec<String>,

    /// Server name reported during initialize
    #[arg(long, default_value = "toolmesh-demo")]
    name: String,

    /// Serve streamable HTTP on this address instead of stdio
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Reply with `text/event-stream` bodies (HTTP only)
    #[arg(long, requires = "listen")]
    sse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Toolset {
    Math,
    Weather,
    Diagnostics,
}

impl Toolset {
    fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "math" => Some(Self::Math),
            "weather" => Some(Self::Weather),
            "diagnostics" => Some(Self::Diagnostics),
            _ => None,
        }
    }

    fn tools(self) -> Vec<Value> {
        let number_pair = json!({
            "type": "object",
            "properties": {
                "a": { "type": "integer" },
                "b": { "type": "integer" }
            },
            "required": ["a", "b"]
        });
        match self {
            Self::Math => vec![
                json!({ "name": "add", "description": "Add two numbers", "inputSchema": number_pair }),
                json!({ "name": "multiply", "description": "Multiply two numbers", "inputSchema": number_pair }),
            ],
            Self::Weather => vec![json!({
                "name": "get_weather",
                "description": "Get the weather for a location",
                "inputSchema": {
                    "type": "object",
                    "properties": { "location": { "type": "string" } },
                    "required": ["location"]
                }
            })],
            Self::Diagnostics => vec![
                json!({
                    "name": "sleep",
                    "description": "Wait before replying",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "ms": { "type": "integer" } },
                        "required": ["ms"]
                    }
                }),
                json!({
                    "name": "crash",
                    "description": "Exit without replying",
                    "inputSchema": { "type": "object" }
                }),
            ],
        }
    }
}

struct DemoServer {
    name: String,
    toolsets: BTreeSet<Toolset>,
}

enum Reply {
    Result(Value),
    Error(i64, String),
}

impl DemoServer {
    async fn handle(&self, method: &str, params: &Value) -> Reply {
        match method {
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or_else(|| json!("2024-11-05"));
                Reply::Result(json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": self.name, "version": env!("CARGO_PKG_VERSION") }
                }))
            }
            "ping" => Reply::Result(json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self.toolsets.iter().flat_map(|set| set.tools()).collect();
                Reply::Result(json!({ "tools": tools }))
            }
            "tools/call" => self.call(params).await,
            other => Reply::Error(METHOD_NOT_FOUND, format!("method not found: {other}")),
        }
    }

    /// Reply to one JSON-RPC message; notifications and stray responses get none.
    async fn respond(&self, message: &Value) -> Option<Value> {
        let id = message.get("id").cloned()?;
        let method = message.get("method").and_then(Value::as_str)?;
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        Some(match self.handle(method, &params).await {
            Reply::Result(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Reply::Error(code, message) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            }),
        })
    }

    fn enabled(&self, tool: &str) -> bool {
        self.toolsets
            .iter()
            .flat_map(|set| set.tools())
            .any(|descriptor| descriptor["name"] == tool)
    }

    async fn call(&self, params: &Value) -> Reply {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        if !self.enabled(name) {
            return Reply::Error(INVALID_PARAMS, format!("Unknown tool: {name}"));
        }
        tracing::info!(tool = name, "tool call");

        match name {
            "add" | "multiply" => {
                let (Some(a), Some(b)) = (number(&arguments, "a"), number(&arguments, "b")) else {
                    return tool_error("arguments 'a' and 'b' must be numbers");
                };
                let value = if name == "add" { a + b } else { a * b };
                text_result(format_number(value))
            }
            "get_weather" => match arguments.get("location").and_then(Value::as_str) {
                Some(_) => text_result(WEATHER_REPORT.to_string()),
                None => tool_error("argument 'location' is required"),
            },
            "sleep" => {
                let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                text_result(format!("slept {ms}ms"))
            }
            "crash" => {
                tracing::warn!("crash requested, exiting");
                std::process::exit(3);
            }
            _ => Reply::Error(INVALID_PARAMS, format!("Unknown tool: {name}")),
        }
    }
}

fn number(arguments: &Value, key: &str) -> Option<f64> {
    arguments.get(key).and_then(Value::as_f64)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn text_result(text: String) -> Reply {
    Reply::Result(json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false
    }))
}

fn tool_error(message: &str) -> Reply {
    Reply::Result(json!({
        "content": [{ "type": "text", "text": message }],
        "isError": true
    }))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut toolsets = BTreeSet::new();
    for name in &args.toolsets {
        match Toolset::parse(name) {
            Some(set) => {
                toolsets.insert(set);
            }
            None => tracing::warn!(toolset = %name, "ignoring unknown toolset"),
        }
    }
    let server = DemoServer {
        name: args.name,
        toolsets,
    };
    tracing::info!(name = %server.name, toolsets = ?server.toolsets, "demo server ready");

    match args.listen {
        Some(addr) => serve_http(server, addr, args.sse).await,
        None => serve_stdio(server).await,
    }
}

async fn serve_stdio(server: DemoServer) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(message) => server.respond(&message).await,
            Err(e) => Some(json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": { "code": PARSE_ERROR, "message": e.to_string() }
            })),
        };
        if let Some(reply) = reply {
            write_message(&mut stdout, &reply).await?;
        }
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

async fn write_message(stdout: &mut tokio::io::Stdout, message: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    stdout.write_all(&bytes).await?;
    stdout.flush().await
}

struct HttpState {
    server: DemoServer,
    sse: bool,
    sessions: Mutex<HashSet<String>>,
}

impl HttpState {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn serve_http(server: DemoServer, addr: SocketAddr, sse: bool) -> std::io::Result<()> {
    let state = Arc::new(HttpState {
        server,
        sse,
        sessions: Mutex::new(HashSet::new()),
    });
    let app = Router::new()
        .route("/mcp", post(post_message).delete(delete_session))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    println!("listening on http://{bound}/mcp");
    tracing::info!(addr = %bound, sse, "serving streamable HTTP");
    axum::serve(listener, app).await
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|value| value.to_str().ok())
}

async fn post_message(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    let is_initialize = message.get("method").and_then(Value::as_str) == Some("initialize");
    let mut assigned = None;
    if is_initialize {
        let id = uuid::Uuid::new_v4().to_string();
        state.sessions().insert(id.clone());
        assigned = Some(id);
    } else {
        match session_id(&headers) {
            None => return (StatusCode::BAD_REQUEST, "missing session id").into_response(),
            Some(id) if !state.sessions().contains(id) => {
                return (StatusCode::NOT_FOUND, "unknown session").into_response()
            }
            Some(_) => {}
        }
    }

    let Some(reply) = state.server.respond(&message).await else {
        return StatusCode::ACCEPTED.into_response();
    };
    let mut response = if state.sse {
        (
            [(CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {reply}\n\n"),
        )
            .into_response()
    } else {
        Json(reply).into_response()
    };
    if let Some(id) = assigned.and_then(|id| id.parse().ok()) {
        response.headers_mut().insert(SESSION_HEADER, id);
    }
    response
}

async fn delete_session(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> StatusCode {
    match session_id(&headers) {
        Some(id) if state.sessions().remove(id) => {
            tracing::info!(session = %id, "session closed");
            StatusCode::OK
        }
        _ => StatusCode::NOT_FOUND,
    }
}
