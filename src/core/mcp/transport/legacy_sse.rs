use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use reqwest_eventsource::{Error as SourceError, Event, EventSource, retry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Transport;
use super::http::HttpStatusError;
use crate::core::mcp::rpc::RpcSession;

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// The older HTTP+SSE transport: a long-lived GET stream carries every server message, and the
/// first `endpoint` event names the URL to POST requests to.
pub(crate) struct LegacySse {
    client: Client,
    endpoint: Url,
    session: Arc<RpcSession>,
    cancel: CancellationToken,
}

impl LegacySse {
    pub(crate) async fn connect(client: Client, url: &str, session: Arc<RpcSession>) -> Result<Self> {
        let base = Url::parse(url)?;
        let mut source = EventSource::new(client.get(base.clone()))
            .map_err(|_| anyhow!("SSE request for [{}] cannot be built", session.server_id()))?;
        source.set_retry_policy(Box::new(retry::Never));

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, wait_for_endpoint(&mut source, &base)).await {
            Ok(endpoint) => endpoint?,
            Err(_) => {
                source.close();
                return Err(anyhow!("MCP server [{}] never announced its endpoint", session.server_id()));
            }
        };
        info!("MCP server [{}] connected over SSE, posting to {}", session.server_id(), endpoint.path());

        let cancel = CancellationToken::new();
        let reader_session = session.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => break,
                    event = source.next() => event,
                };
                match event {
                    Some(Ok(Event::Message(message))) if message.event == "message" => {
                        reader_session.dispatch_raw(&message.data).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(SourceError::StreamEnded)) | None => break,
                    Some(Err(e)) => {
                        warn!("MCP SSE stream for [{}] failed: {}", reader_session.server_id(), e);
                        break;
                    }
                }
            }
            source.close();
            if !reader_cancel.is_cancelled() {
                reader_session.close().await;
            }
        });

        Ok(Self {
            client,
            endpoint,
            session,
            cancel,
        })
    }
}

async fn wait_for_endpoint(source: &mut EventSource, base: &Url) -> Result<Url> {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Message(message)) if message.event == "endpoint" => {
                return Ok(base.join(message.data.trim())?);
            }
            Ok(_) => {}
            Err(SourceError::InvalidStatusCode(status, response)) => {
                let body = response.text().await.unwrap_or_default();
                return Err(HttpStatusError {
                    status: status.as_u16(),
                    body,
                }
                .into());
            }
            Err(e) => return Err(anyhow!("SSE stream failed before the endpoint event: {}", e)),
        }
    }
    Err(anyhow!("SSE stream ended before the endpoint event"))
}

impl Drop for LegacySse {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for LegacySse {
    async fn send(&self, message: String) -> Result<()> {
        debug!("MCP TX [{}]: {}", self.session.server_id(), message);
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message)
            .send()
            .await
            .map_err(|e| anyhow!("MCP request to [{}] failed: {}", self.session.server_id(), e.without_url()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpStatusError {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(())
    }
}

