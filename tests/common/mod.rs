#![allow(dead_code)]

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use toolmesh::config::ServerConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const WEATHER_REPORT: &str = "It's always rains in Pune";

/// Path of the bundled demo server binary.
pub fn demo_server() -> &'static str {
    env!("CARGO_BIN_EXE_toolmesh-demo-server")
}

/// Subprocess entry for the demo server with the given toolsets.
pub fn demo_entry(id: &str, toolsets: &str) -> ServerConfig {
    ServerConfig::subprocess(id, demo_server(), ["--toolsets", toolsets, "--name", id])
}

/// Demo server running in HTTP mode; killed on drop.
pub struct HttpDemo {
    pub url: String,
    _child: Child,
}

/// Spawn the demo server on an ephemeral port and wait for its address.
pub async fn spawn_http_demo(toolsets: &str, sse: bool) -> HttpDemo {
    let mut command = Command::new(demo_server());
    command
        .args(["--toolsets", toolsets, "--listen", "127.0.0.1:0"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if sse {
        command.arg("--sse");
    }
    let mut child = command.spawn().expect("spawn demo server");

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();
    let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
        .await
        .expect("demo server announces its address")
        .expect("read stdout")
        .expect("stdout line");
    let url = line
        .strip_prefix("listening on ")
        .expect("listening line")
        .to_owned();
    HttpDemo { url, _child: child }
}

/// Streamable-HTTP weather server answering JSON-RPC with JSON or SSE bodies.
pub struct WeatherResponder {
    pub sse: bool,
}

impl Respond for WeatherResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).expect("request body is JSON");
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str() {
            Some("initialize") => json!({
                "protocolVersion": body["params"]["protocolVersion"],
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "weather", "version": "1.0.0" }
            }),
            Some("tools/list") => json!({
                "tools": [{
                    "name": "get_weather",
                    "description": "Get the weather location",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "location": { "type": "string" } },
                        "required": ["location"]
                    }
                }]
            }),
            Some("tools/call") => json!({
                "content": [{ "type": "text", "text": WEATHER_REPORT }],
                "isError": false
            }),
            _ => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": { "code": -32601, "message": "method not found" }
                }))
            }
        };
        let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        let template = if self.sse {
            ResponseTemplate::new(200).set_body_raw(format!("data: {reply}\n\n"), "text/event-stream")
        } else {
            ResponseTemplate::new(200).set_body_json(reply)
        };
        template.insert_header("mcp-session-id", "weather-session")
    }
}

pub async fn weather_server(sse: bool) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(WeatherResponder { sse })
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

pub fn weather_entry(server: &MockServer) -> ServerConfig {
    ServerConfig::http_stream("weather", format!("{}/mcp", server.uri()))
}

/// URL of a port nothing listens on.
pub fn offline_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    format!("http://127.0.0.1:{port}/mcp")
}
