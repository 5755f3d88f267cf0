//! Per-server transport configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, ToolMeshError};

/// Transport kind selected by a server entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
    Subprocess,
    HttpStream,
}

/// Connection parameters for one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn a child process and speak line-delimited JSON-RPC over its stdio.
    #[serde(alias = "stdio")]
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// JSON-RPC over HTTP POST, with JSON or SSE response bodies.
    #[serde(alias = "streamable_http", alias = "streamable-http", alias = "http")]
    HttpStream {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Subprocess { .. } => TransportKind::Subprocess,
            Self::HttpStream { .. } => TransportKind::HttpStream,
        }
    }
}

/// One configured tool server. Immutable once loaded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub required: bool,
}

impl ServerConfig {
    pub fn subprocess(
        id: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Subprocess {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: BTreeMap::new(),
                cwd: None,
            },
            timeout_ms: None,
            required: false,
        }
    }

    pub fn http_stream(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::HttpStream {
                url: url.into(),
                headers: BTreeMap::new(),
            },
            timeout_ms: None,
            required: false,
        }
    }

    /// Add a child environment variable. Ignored for HTTP entries.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Subprocess { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a request header. Ignored for subprocess entries.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::HttpStream { headers, .. } = &mut self.transport {
            headers.insert(name.into(), value.into());
        }
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Per-server cap applied to every operation deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Check the entry is usable before any I/O is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ToolMeshError::Configuration(
                "server id must not be empty".into(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(ToolMeshError::Configuration(format!(
                "server '{}': timeout_ms must be positive",
                self.id
            )));
        }
        match &self.transport {
            TransportConfig::Subprocess { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ToolMeshError::Configuration(format!(
                        "server '{}': command must not be empty",
                        self.id
                    )));
                }
            }
            TransportConfig::HttpStream { url, headers } => {
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    ToolMeshError::Configuration(format!(
                        "server '{}': invalid url '{url}': {e}",
                        self.id
                    ))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ToolMeshError::Configuration(format!(
                        "server '{}': url scheme must be http or https",
                        self.id
                    )));
                }
                for name in headers.keys() {
                    reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                        ToolMeshError::Configuration(format!(
                            "server '{}': invalid header name '{name}'",
                            self.id
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// A configuration entry that could not be turned into a [`ServerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedServer {
    pub id: String,
    pub reason: String,
    pub required: bool,
}

#[derive(Deserialize)]
struct ServerEntry {
    #[serde(flatten)]
    transport: TransportConfig,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    required: bool,
}

/// Parse one raw `[servers.<id>]` entry, interpolating `${VAR}` references.
pub fn parse_server_entry(
    id: &str,
    raw: &serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> std::result::Result<ServerConfig, RejectedServer> {
    let required = raw
        .get("required")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let reject = |reason: String| RejectedServer {
        id: id.to_owned(),
        reason,
        required,
    };

    let interpolated = interpolate_value(raw, lookup).map_err(reject)?;
    let entry: ServerEntry = serde_json::from_value(interpolated)
        .map_err(|e| reject(format!("malformed server entry: {e}")))?;

    let config = ServerConfig {
        id: id.trim().to_owned(),
        transport: entry.transport,
        timeout_ms: entry.timeout_ms,
        required: entry.required,
    };
    config.validate().map_err(|e| reject(e.to_string()))?;
    Ok(config)
}

static ENV_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env reference regex must compile")
});

/// Replace every `${VAR}` in `input`; a missing variable is an error.
pub fn interpolate_env(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> std::result::Result<String, String> {
    let mut missing = None;
    let replaced = ENV_REFERENCE_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| name.to_owned());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(format!("environment variable '{name}' is not set")),
        None => Ok(replaced.into_owned()),
    }
}

fn interpolate_value(
    value: &serde_json::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> std::result::Result<serde_json::Value, String> {
    Ok(match value {
        serde_json::Value::String(s) => serde_json::Value::String(interpolate_env(s, lookup)?),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, lookup))
                .collect::<std::result::Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate_value(item, lookup)?);
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn vars(name: &str) -> Option<String> {
        match name {
            "GITHUB_TOKEN" => Some("ghp_secret".into()),
            "WEATHER_HOST" => Some("127.0.0.1:8000".into()),
            _ => None,
        }
    }

    #[test]
    fn builder_helpers_only_touch_their_transport() {
        let http = ServerConfig::http_stream("weather", "http://127.0.0.1:8000/mcp")
            .with_header("Authorization", "Bearer t")
            .with_env("IGNORED", "1");
        assert_eq!(
            http.transport,
            TransportConfig::HttpStream {
                url: "http://127.0.0.1:8000/mcp".into(),
                headers: BTreeMap::from([("Authorization".to_string(), "Bearer t".to_string())]),
            }
        );

        let stdio = ServerConfig::subprocess("math", "demo", Vec::<String>::new())
            .with_header("Authorization", "Bearer t");
        assert!(matches!(
            stdio.transport,
            TransportConfig::Subprocess { ref env, .. } if env.is_empty()
        ));
    }

    #[test]
    fn parses_subprocess_entry_with_env_interpolation() {
        let raw = json!({
            "transport": "stdio",
            "command": "./github-mcp-server",
            "args": ["stdio", "--dynamic-toolsets"],
            "env": { "GITHUB_PERSONAL_ACCESS_TOKEN": "${GITHUB_TOKEN}" },
            "unknown_field": true
        });

        let config = parse_server_entry("github", &raw, &vars).expect("entry should parse");
        assert_eq!(config.kind(), TransportKind::Subprocess);
        assert_eq!(
            config.transport,
            TransportConfig::Subprocess {
                command: "./github-mcp-server".into(),
                args: vec!["stdio".into(), "--dynamic-toolsets".into()],
                env: BTreeMap::from([(
                    "GITHUB_PERSONAL_ACCESS_TOKEN".to_string(),
                    "ghp_secret".to_string()
                )]),
                cwd: None,
            }
        );
        assert!(!config.required);
    }

    #[test]
    fn parses_streamable_http_alias() {
        let raw = json!({
            "transport": "streamable_http",
            "url": "http://${WEATHER_HOST}/mcp",
            "timeout_ms": 20000
        });

        let config = parse_server_entry("weather", &raw, &vars).expect("entry should parse");
        assert_eq!(config.kind(), TransportKind::HttpStream);
        assert_eq!(config.timeout(), Some(Duration::from_secs(20)));
        assert!(matches!(
            config.transport,
            TransportConfig::HttpStream { ref url, .. } if url == "http://127.0.0.1:8000/mcp"
        ));
    }

    #[test]
    fn missing_env_var_rejects_only_that_entry() {
        let raw = json!({
            "transport": "subprocess",
            "command": "server",
            "env": { "TOKEN": "${NOT_SET_ANYWHERE}" },
            "required": true
        });

        let rejected = parse_server_entry("gh", &raw, &vars).expect_err("missing var must reject");
        assert_eq!(rejected.id, "gh");
        assert!(rejected.required);
        assert!(rejected.reason.contains("NOT_SET_ANYWHERE"));
    }

    #[test]
    fn rejects_unknown_transport_and_missing_fields() {
        let unknown = parse_server_entry("x", &json!({"transport": "carrier-pigeon"}), &vars);
        assert!(unknown.is_err());

        let no_command = parse_server_entry("x", &json!({"transport": "subprocess"}), &vars);
        assert!(no_command.is_err());

        let bad_url = parse_server_entry(
            "x",
            &json!({"transport": "http-stream", "url": "ftp://example.com"}),
            &vars,
        )
        .expect_err("non-http scheme must reject");
        assert!(bad_url.reason.contains("http or https"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = ServerConfig::subprocess("math", "demo", ["--toolsets", "math"])
            .with_timeout_ms(0)
            .validate()
            .expect_err("zero timeout is invalid");
        assert!(matches!(err, ToolMeshError::Configuration(_)));
    }

    #[test]
    fn transport_kind_round_trips_through_strings() {
        assert_eq!(TransportKind::HttpStream.to_string(), "http-stream");
        assert_eq!(
            "subprocess".parse::<TransportKind>().expect("kind should parse"),
            TransportKind::Subprocess
        );
    }
}
