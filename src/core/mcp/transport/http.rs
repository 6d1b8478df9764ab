use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use reqwest_eventsource::{Event, EventSource, retry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Transport;
use crate::core::llm::sse::sse_events;
use crate::core::mcp::rpc::RpcSession;

pub(crate) const SESSION_HEADER: &str = "mcp-session-id";

/// Non-success answer from an MCP HTTP endpoint.
#[derive(Debug, Error)]
#[error("MCP endpoint answered HTTP {status}: {body}")]
pub(crate) struct HttpStatusError {
    pub status: u16,
    pub body: String,
}

/// The streamable HTTP transport: every message is a POST, answered with JSON or with an
/// event stream. Server notifications arrive on an optional GET stream.
pub(crate) struct StreamableHttp {
    client: Client,
    url: String,
    session: Arc<RpcSession>,
    session_id: Mutex<Option<String>>,
    initialized: AtomicBool,
    cancel: CancellationToken,
}

impl StreamableHttp {
    pub(crate) fn new(client: Client, url: &str, session: Arc<RpcSession>) -> Self {
        Self {
            client,
            url: url.to_string(),
            session,
            session_id: Mutex::new(None),
            initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_session_id(&self, response: &Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.to_string());
        }
    }

    fn read_event_stream(&self, response: Response) {
        let session = self.session.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let body = response.bytes_stream().map_err(reqwest::Error::without_url);
            let mut events = Box::pin(sse_events(Box::pin(body)));
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(event)) => session.dispatch_raw(&event.data).await,
                    Some(Err(e)) => {
                        warn!("MCP response stream for [{}] failed: {}", session.server_id(), e);
                        break;
                    }
                    None => break,
                }
            }
        });
    }
}

impl Drop for StreamableHttp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for StreamableHttp {
    async fn send(&self, message: String) -> Result<()> {
        debug!("MCP TX [{}]: {}", self.session.server_id(), message);
        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .body(message);
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_HEADER, id);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // A server that went away after the handshake counts as closed.
                if e.is_connect() && self.initialized.load(Ordering::SeqCst) {
                    self.session.close().await;
                }
                return Err(anyhow!(
                    "MCP request to [{}] failed: {}",
                    self.session.server_id(),
                    e.without_url()
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpStatusError {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        self.remember_session_id(&response);
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        if is_stream {
            self.read_event_stream(response);
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| anyhow!("MCP reply from [{}] unreadable: {}", self.session.server_id(), e.without_url()))?;
            if !body.trim().is_empty() {
                self.session.dispatch_raw(&body).await;
            }
        }
        Ok(())
    }

    /// Opens the GET stream for server-initiated notifications. Servers that do not offer one
    /// answer 405, which is not an error.
    async fn on_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        let mut request = self.client.get(&self.url).header(ACCEPT, "text/event-stream");
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_HEADER, id);
        }
        let Ok(mut source) = EventSource::new(request) else {
            return;
        };
        source.set_retry_policy(Box::new(retry::Never));

        let session = self.session.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = source.next() => event,
                };
                match event {
                    Some(Ok(Event::Open)) => debug!("MCP notification stream open [{}]", session.server_id()),
                    Some(Ok(Event::Message(message))) => session.dispatch_raw(&message.data).await,
                    Some(Err(e)) => {
                        debug!("MCP notification stream for [{}] ended: {}", session.server_id(), e);
                        break;
                    }
                    None => break,
                }
            }
            source.close();
        });
    }
}
