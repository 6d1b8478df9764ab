//! Tool-server plumbing: MCP clients over HTTP, SSE or stdio, the `mcp.json` bridge and the
//! connectivity monitor that turns bridge signals into a single status indicator.

pub mod bridge;
pub mod client;
pub mod config;
mod rpc;
pub mod status;
mod transport;

pub use bridge::{McpBridge, ToolBridge};
pub use client::McpClient;
pub use rpc::McpTool;
pub use status::{ConnectivityStatus, ProbeSettings, StatusMonitor};

/// Push signals from a tool server, keyed by server id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    ToolsListChanged { id: String },
    Error { id: String, message: String },
    Close { id: String },
}

#[cfg(test)]
mod tests;
