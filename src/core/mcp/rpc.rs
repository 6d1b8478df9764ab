use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, warn};

use super::BridgeEvent;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Option<u64>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Anything the server sends: a response (has `id`) or a notification (has `method`).
#[derive(Deserialize, Debug, Clone)]
pub(crate) struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
pub(crate) struct JsonRpcResponse {
    pub result: Option<Value>,
    pub error: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Request bookkeeping for one server connection, shared by the client and its transport.
pub(crate) struct RpcSession {
    server_id: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    // Only flipped while `pending` is locked, so no request can slip in after the close.
    closed: AtomicBool,
    events: broadcast::Sender<BridgeEvent>,
}

impl RpcSession {
    pub fn new(server_id: &str, events: broadcast::Sender<BridgeEvent>) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.to_string(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            events,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reserves an id and a reply slot, or fails at once when the connection is gone.
    pub async fn register(&self) -> Result<(u64, oneshot::Receiver<JsonRpcResponse>)> {
        let mut pending = self.pending.lock().await;
        if self.is_closed() {
            return Err(anyhow!("MCP server [{}] is closed", self.server_id));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok((id, rx))
    }

    pub async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Marks the connection closed, fails every pending request and publishes `Close` once.
    pub async fn close(&self) {
        let mut pending = self.pending.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders fails every waiting request.
        pending.clear();
        drop(pending);
        warn!("MCP connection closed for server [{}].", self.server_id);
        let _ = self.events.send(BridgeEvent::Close {
            id: self.server_id.clone(),
        });
    }

    /// Routes one raw payload, which may be a single message or a JSON-RPC batch.
    pub async fn dispatch_raw(&self, raw: &str) {
        debug!("MCP RX [{}]: {}", self.server_id, raw);
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                warn!("Unparsed MCP RX [{}]: {}", self.server_id, raw);
                return;
            }
        };
        let messages = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        for message in messages {
            match serde_json::from_value::<JsonRpcMessage>(message) {
                Ok(msg) => self.dispatch(msg).await,
                Err(e) => warn!("Malformed MCP message from [{}]: {}", self.server_id, e),
            }
        }
    }

    async fn dispatch(&self, msg: JsonRpcMessage) {
        match (msg.id, msg.method.as_deref()) {
            (Some(id), None) => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(JsonRpcResponse {
                        result: msg.result,
                        error: msg.error,
                    });
                }
            }
            (None, Some(method)) => on_notification(&self.server_id, method, &self.events),
            // Server-initiated requests (sampling, roots) are not supported.
            _ => debug!("Ignoring MCP request from [{}]", self.server_id),
        }
    }
}

pub(crate) fn on_notification(
    server_id: &str,
    method: &str,
    events: &broadcast::Sender<BridgeEvent>,
) {
    match method {
        "notifications/tools/list_changed" => {
            debug!("MCP tool list changed [{}]", server_id);
            let _ = events.send(BridgeEvent::ToolsListChanged {
                id: server_id.to_string(),
            });
        }
        other => debug!("Ignoring MCP notification [{}]: {}", server_id, other),
    }
}

pub(crate) fn parse_tool_list(result: &Value) -> Vec<McpTool> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_lists_skip_malformed_entries() {
        let result = json!({
            "tools": [
                { "name": "search", "description": "web", "inputSchema": { "type": "object" } },
                { "description": "nameless" },
                { "name": "bare" }
            ]
        });
        let tools = parse_tool_list(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[1].input_schema, Value::Null);
        assert!(parse_tool_list(&json!({})).is_empty());
    }

    #[test]
    fn list_changed_notification_becomes_bridge_event() {
        let (tx, mut rx) = broadcast::channel(4);
        on_notification("fs", "notifications/tools/list_changed", &tx);
        on_notification("fs", "notifications/progress", &tx);
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeEvent::ToolsListChanged { id: "fs".into() }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notifications_serialize_without_an_id() {
        let notif = JsonRpcRequest::new(None, "notifications/initialized", None);
        assert_eq!(
            serde_json::to_value(&notif).unwrap(),
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" })
        );
    }

    #[tokio::test]
    async fn responses_reach_their_request_even_inside_a_batch() {
        let (tx, mut events) = broadcast::channel(4);
        let session = RpcSession::new("fs", tx);
        let (first, first_rx) = session.register().await.unwrap();
        let (second, second_rx) = session.register().await.unwrap();

        session
            .dispatch_raw(
                &json!([
                    { "jsonrpc": "2.0", "id": second, "result": { "n": 2 } },
                    { "jsonrpc": "2.0", "method": "notifications/tools/list_changed" },
                    { "jsonrpc": "2.0", "id": first, "error": { "code": -1 } }
                ])
                .to_string(),
            )
            .await;

        assert_eq!(second_rx.await.unwrap().result, Some(json!({ "n": 2 })));
        assert!(first_rx.await.unwrap().error.is_some());
        assert_eq!(
            events.try_recv().unwrap(),
            BridgeEvent::ToolsListChanged { id: "fs".into() }
        );
    }

    #[tokio::test]
    async fn close_fails_waiters_and_refuses_new_requests() {
        let (tx, mut events) = broadcast::channel(4);
        let session = RpcSession::new("fs", tx);
        let (_, waiting) = session.register().await.unwrap();

        session.close().await;
        session.close().await;

        assert!(waiting.await.is_err());
        assert!(session.register().await.is_err());
        assert_eq!(events.try_recv().unwrap(), BridgeEvent::Close { id: "fs".into() });
        assert!(events.try_recv().is_err());
    }
}
