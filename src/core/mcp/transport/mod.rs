//! Wire transports for MCP sessions. A transport only moves JSON-RPC text; replies and
//! notifications it receives are handed to the session it was built with.

mod http;
mod legacy_sse;
mod stdio;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

pub(crate) use http::{HttpStatusError, StreamableHttp};
pub(crate) use legacy_sse::LegacySse;
pub(crate) use stdio::StdioTransport;

#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// Delivers one serialized JSON-RPC message.
    async fn send(&self, message: String) -> Result<()>;

    /// Runs once the `initialize` handshake has completed.
    async fn on_initialized(&self) {}

    /// Extra detail for a failed handshake, such as the server's stderr.
    async fn diagnostics(&self) -> String {
        String::new()
    }
}

/// Builds the HTTP client shared by both URL transports, carrying the configured headers on
/// every request.
pub(crate) fn http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    Ok(reqwest::Client::builder().default_headers(map).build()?)
}

/// True when the error is an HTTP 4xx answer, which means the endpoint does not speak the
/// streamable transport.
pub(crate) fn is_client_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpStatusError>()
        .is_some_and(|e| (400..500).contains(&e.status))
}
