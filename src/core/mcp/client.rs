use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::BridgeEvent;
use super::rpc::{JsonRpcRequest, McpTool, RpcSession, parse_tool_list};
use super::transport::{
    LegacySse, StdioTransport, StreamableHttp, Transport, http_client, is_client_error,
};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC client for one MCP server, over whichever transport its config entry names.
pub struct McpClient {
    session: Arc<RpcSession>,
    transport: Box<dyn Transport>,
}

impl McpClient {
    fn new(session: Arc<RpcSession>, transport: Box<dyn Transport>) -> Self {
        Self { session, transport }
    }

    /// Spawns a local server and performs the `initialize` handshake over its stdio. Server
    /// notifications and the end of its stdout are published on `events`.
    pub async fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        events: broadcast::Sender<BridgeEvent>,
    ) -> Result<Arc<Self>> {
        let session = RpcSession::new(server_id, events);
        let transport = StdioTransport::spawn(command, args, env, session.clone())?;
        let client = Self::new(session, Box::new(transport));
        client.handshake().await?;
        Ok(Arc::new(client))
    }

    /// Connects to a remote server over streamable HTTP. An HTTP 4xx on the handshake means the
    /// endpoint predates that transport, so the older SSE transport is tried instead.
    pub async fn connect_url(
        server_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        events: broadcast::Sender<BridgeEvent>,
    ) -> Result<Arc<Self>> {
        let http = http_client(headers)?;

        let session = RpcSession::new(server_id, events.clone());
        let transport = StreamableHttp::new(http.clone(), url, session.clone());
        let client = Self::new(session, Box::new(transport));
        match client.handshake().await {
            Ok(()) => return Ok(Arc::new(client)),
            Err(e) if is_client_error(&e) => {
                info!("MCP server [{}] refused streamable HTTP ({}); trying SSE", server_id, e);
            }
            Err(e) => return Err(e),
        }

        let session = RpcSession::new(server_id, events);
        let transport = LegacySse::connect(http, url, session.clone()).await?;
        let client = Self::new(session, Box::new(transport));
        client.handshake().await?;
        Ok(Arc::new(client))
    }

    pub fn server_id(&self) -> &str {
        self.session.server_id()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    async fn handshake(&self) -> Result<()> {
        let server_id = self.server_id();
        let outcome = match tokio::time::timeout(INITIALIZE_TIMEOUT, self.initialize()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(anyhow!("MCP Initialization timeout for [{}]", server_id)),
        };
        match outcome {
            Ok(()) => {
                info!("MCP Server [{}] initialized successfully", server_id);
                self.transport.on_initialized().await;
                Ok(())
            }
            Err(e) => {
                let detail = self.transport.diagnostics().await;
                error!("MCP Server [{}] failed to initialize: {}. {}", server_id, e, detail);
                if detail.is_empty() {
                    Err(e)
                } else {
                    Err(e.context(detail))
                }
            }
        }
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (id, rx) = self.session.register().await?;
        let req = JsonRpcRequest::new(Some(id), method, params);
        if let Err(e) = self.transport.send(serde_json::to_string(&req)?).await {
            self.session.forget(id).await;
            return Err(e);
        }

        let resp = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                return Err(anyhow!(
                    "MCP server [{}] closed during {}",
                    self.server_id(),
                    method
                ));
            }
            Err(_) => {
                self.session.forget(id).await;
                return Err(anyhow!("MCP {} timed out for [{}]", method, self.server_id()));
            }
        };
        if let Some(error) = resp.error {
            return Err(anyhow!("MCP RPC Error: {:?}", error));
        }

        resp.result.ok_or_else(|| anyhow!("MCP RPC Missing result"))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("MCP server [{}] is closed", self.server_id()));
        }
        let notif = JsonRpcRequest::new(None, method, params);
        self.transport.send(serde_json::to_string(&notif)?).await
    }

    async fn initialize(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let resp = self.call("initialize", Some(params)).await?;
        debug!("MCP Initialized [{}]: {:?}", self.server_id(), resp);
        self.notify("notifications/initialized", None).await
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.call("tools/list", None).await?;
        Ok(parse_tool_list(&result))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments
        });
        self.call("tools/call", Some(params)).await
    }
}
