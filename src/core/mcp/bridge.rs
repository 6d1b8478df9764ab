use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use super::BridgeEvent;
use super::client::McpClient;
use super::config::{self, ServerTransport};
use super::rpc::McpTool;

const EVENT_CAPACITY: usize = 64;

/// The tool-server operations the status prober relies on.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Connects every configured server and returns the ids that came up.
    async fn create_from_config(&self) -> Result<Vec<String>>;

    async fn list_tools(&self, id: &str) -> Result<Vec<McpTool>>;

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;
}

/// The MCP servers declared in `mcp.json`, remote or local.
pub struct McpBridge {
    config_path: PathBuf,
    clients: Mutex<HashMap<String, Arc<McpClient>>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl McpBridge {
    pub fn new(config_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config_path,
            clients: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let client = self.client(id).await?;
        client.call_tool(name, arguments).await
    }

    async fn client(&self, id: &str) -> Result<Arc<McpClient>> {
        self.clients
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("No MCP server named [{}]", id))
    }
}

#[async_trait]
impl ToolBridge for McpBridge {
    async fn create_from_config(&self) -> Result<Vec<String>> {
        let servers = config::load_servers(&self.config_path)?;
        let mut ids = Vec::new();
        for server in servers {
            let connected = match &server.transport {
                ServerTransport::Url { url, headers } => {
                    McpClient::connect_url(&server.id, url, headers, self.events.clone()).await
                }
                ServerTransport::Stdio { command, args, env } => {
                    McpClient::spawn(&server.id, command, args, env, self.events.clone()).await
                }
            };
            match connected {
                Ok(client) => {
                    self.clients.lock().await.insert(server.id.clone(), client);
                    ids.push(server.id);
                }
                Err(e) => {
                    warn!("MCP server [{}] did not start: {}", server.id, e);
                    let _ = self.events.send(BridgeEvent::Error {
                        id: server.id,
                        message: e.to_string(),
                    });
                }
            }
        }
        info!("MCP servers connected: {:?}", ids);
        Ok(ids)
    }

    async fn list_tools(&self, id: &str) -> Result<Vec<McpTool>> {
        let client = self.client(id).await?;
        client.list_tools().await
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}
