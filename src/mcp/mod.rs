//! Model Context Protocol (MCP) tool-server client.

pub mod aggregate;
pub mod channel;
pub mod schema;
pub mod transport;

pub use aggregate::{
    merge_catalogs, CatalogEntry, ChannelOpener, CollisionPolicy, MergedCatalog,
    MultiServerClient, ServerStatus, ShadowedTool, TransportOpener,
};
pub use channel::{MCPChannel, ToolCallOutcome, ToolCallResult, ToolChannel};
pub use schema::{parse_catalog, ToolDescriptor};
pub use transport::{HttpStreamTransport, MCPSession, MCPTransport, RawToolResult, StdioTransport};
