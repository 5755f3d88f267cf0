//! Error types for toolmesh.

use thiserror::Error;

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Protocol,
    Schema,
    Routing,
    Timeout,
    Transport,
    Network,
    Authentication,
    RateLimit,
    Server,
    Api,
    Serialization,
    ToolExecution,
    Unknown,
}

/// Primary error type for all toolmesh operations.
#[derive(Error, Debug)]
pub enum ToolMeshError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A channel could not be opened.
    #[error("Connection error ({server}): {message}")]
    Connection { server: String, message: String },

    /// Malformed catalog or call response.
    #[error("Protocol error ({server}): {message}")]
    Protocol { server: String, message: String },

    /// Malformed tool descriptor.
    #[error("Schema error ({server}): {message}")]
    Schema { server: String, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Mid-call I/O failure.
    #[error("Transport error ({server}): {message}")]
    Transport { server: String, message: String },

    /// No server yielded a usable catalog, or the merge policy rejected it.
    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Decision-maker error: {0}")]
    DecisionMaker(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ToolMeshError {
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn protocol(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn schema(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidArgument(_) => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::UnknownTool(_) | Self::Aggregation(_) => ErrorCategory::Routing,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Transport { .. } | Self::Io(_) => ErrorCategory::Transport,
            Self::Network(_) => ErrorCategory::Network,
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::DecisionMaker(_) | Self::InvalidState(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Server
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ToolMeshError>;
