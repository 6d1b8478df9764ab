use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::core::mcp::{BridgeEvent, McpBridge, McpClient, ToolBridge};

fn reply(request: &Value) -> Value {
    let result = match request["method"].as_str() {
        Some("initialize") => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": true } },
            "serverInfo": { "name": "mock", "version": "0" }
        }),
        Some("tools/list") => json!({ "tools": [{ "name": "search", "inputSchema": {} }] }),
        _ => json!({}),
    };
    json!({ "jsonrpc": "2.0", "id": request["id"], "result": result })
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ── streamable HTTP server ──

#[derive(Clone, Default)]
struct Streamable {
    session_headers: Arc<Mutex<Vec<Option<String>>>>,
}

async fn streamable_post(
    State(state): State<Streamable>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("secret") {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.session_headers.lock().unwrap().push(session);

    if request.get("id").is_none() {
        return StatusCode::ACCEPTED.into_response();
    }
    match request["method"].as_str() {
        Some("initialize") => {
            ([("mcp-session-id", "sess-1")], Json(reply(&request))).into_response()
        }
        // Answered as an event stream, the way streaming servers reply.
        _ => (
            [(header::CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {}\n\n", reply(&request)),
        )
            .into_response(),
    }
}

async fn spawn_streamable() -> (String, Streamable) {
    let state = Streamable::default();
    let app = Router::new()
        .route(
            "/mcp",
            post(streamable_post).get(|| async { StatusCode::METHOD_NOT_ALLOWED }),
        )
        .with_state(state.clone());
    (format!("{}/mcp", serve(app).await), state)
}

// ── legacy HTTP+SSE server ──

#[derive(Clone, Default)]
struct Legacy {
    stream: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

async fn legacy_stream(State(state): State<Legacy>) -> impl IntoResponse {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *state.stream.lock().unwrap() = Some(tx);
    Sse::new(async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages?sessionId=7"));
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message));
        }
    })
}

async fn legacy_message(State(state): State<Legacy>, Json(request): Json<Value>) -> StatusCode {
    if request.get("id").is_some()
        && let Some(tx) = state.stream.lock().unwrap().as_ref()
    {
        let _ = tx.send(reply(&request).to_string());
    }
    StatusCode::ACCEPTED
}

async fn spawn_legacy() -> (String, Legacy) {
    let state = Legacy::default();
    let app = Router::new()
        .route(
            "/sse",
            axum::routing::get(legacy_stream).post(|| async { StatusCode::NOT_FOUND }),
        )
        .route("/messages", post(legacy_message))
        .with_state(state.clone());
    (format!("{}/sse", serve(app).await), state)
}

#[tokio::test]
async fn streamable_http_carries_headers_and_session_id() {
    let (url, state) = spawn_streamable().await;
    let (events, _rx) = broadcast::channel(8);
    let headers = HashMap::from([("x-api-key".to_string(), "secret".to_string())]);

    let client = McpClient::connect_url("docs", &url, &headers, events).await.unwrap();
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "search");

    let seen = state.session_headers.lock().unwrap().clone();
    assert_eq!(seen[0], None);
    assert!(seen[1..].iter().all(|s| s.as_deref() == Some("sess-1")));
}

#[tokio::test]
async fn missing_headers_are_not_retried_over_sse() {
    let (url, _state) = spawn_streamable().await;
    let (events, _rx) = broadcast::channel(8);
    assert!(
        McpClient::connect_url("docs", &url, &HashMap::new(), events)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn http_4xx_falls_back_to_sse() {
    let (url, state) = spawn_legacy().await;
    let (events, mut rx) = broadcast::channel(8);

    let client = McpClient::connect_url("legacy", &url, &HashMap::new(), events)
        .await
        .unwrap();
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "search");

    // Ending the event stream is how an SSE server goes away.
    state.stream.lock().unwrap().take();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, BridgeEvent::Close { id: "legacy".into() });
    assert!(client.is_closed());
    assert!(client.list_tools().await.is_err());
}

#[tokio::test]
async fn bridge_connects_url_entries_from_config() {
    let (url, _state) = spawn_streamable().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "{}",
        json!({ "mcpServers": { "docs": { "url": url, "headers": { "x-api-key": "secret" } } } })
    )
    .unwrap();

    let bridge = McpBridge::new(file.path().to_path_buf());
    assert_eq!(bridge.create_from_config().await.unwrap(), vec!["docs".to_string()]);
    assert_eq!(bridge.list_tools("docs").await.unwrap()[0].name, "search");
}
