use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, stream as futures_stream};
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::LlmError;
use super::normalizer::{ChunkStream, ProviderChunk};
use super::registry::{ApiFormat, AuthType, ProviderDef, ResolvedEndpoint};
use super::sse::{SseEvent, sse_events};
use super::{ChatMessage, LlmProvider, StreamOptions};

/// Anthropic requires an explicit output budget.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 1024;
const RETRY_BASE_DELAY_MS: u64 = 250;

// ── OpenAI-compatible request ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

// ── Anthropic request ──

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

// ── Gemini request ──

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

/// What one SSE event means for the chunk stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    Chunk(Value),
    Skip,
    Done,
}

// ── Generic Provider ──

/// Streaming client for any provider in the registry; the wire format decides request and
/// chunk layout.
pub struct GenericProvider {
    provider_def: ProviderDef,
    endpoint: ResolvedEndpoint,
    client: Client,
}

impl GenericProvider {
    pub fn new(provider_def: ProviderDef, endpoint: ResolvedEndpoint) -> Self {
        info!(
            "Configured {} streaming client (model {})",
            provider_def.name, endpoint.model
        );
        Self {
            provider_def,
            endpoint,
            client: Client::new(),
        }
    }

    /// Builds a client from explicit values and the process environment. Fails without any
    /// network I/O when no credential can be found.
    pub fn from_env(
        provider_def: ProviderDef,
        api_key: Option<&str>,
        model: Option<&str>,
    ) -> Result<Self, LlmError> {
        let endpoint = provider_def.resolve(api_key, model, |name| std::env::var(name).ok())?;
        Ok(Self::new(provider_def, endpoint))
    }

    fn request_body(&self, messages: &[ChatMessage], options: &StreamOptions) -> Value {
        let body = match self.provider_def.api_format {
            ApiFormat::Openai => serde_json::to_value(openai_request(messages, options)),
            ApiFormat::Anthropic => serde_json::to_value(anthropic_request(messages, options)),
            ApiFormat::Gemini => serde_json::to_value(gemini_request(messages, options)),
        };
        body.unwrap_or(Value::Null)
    }

    fn build_request(&self, body: &Value, options: &StreamOptions) -> RequestBuilder {
        let auth = &self.provider_def.auth;
        let mut url = self.endpoint.base_url.replace("{model}", &options.model);
        if auth.auth_type == AuthType::QueryParam {
            let param_name = auth.param_name.as_deref().unwrap_or("key");
            let sep = if url.contains('?') { '&' } else { '?' };
            url = format!("{}{}{}={}", url, sep, param_name, self.endpoint.api_key);
        }

        let mut request = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(body);
        request = match auth.auth_type {
            AuthType::Bearer => {
                request.header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            }
            AuthType::Header => {
                let header_name = auth.header_name.as_deref().unwrap_or("Authorization");
                request.header(header_name, &self.endpoint.api_key)
            }
            AuthType::QueryParam => request,
        };
        for (k, v) in &self.provider_def.extra_headers {
            request = request.header(k.as_str(), v.as_str());
        }
        request
    }

    /// Sends the request, retrying transient failures. `Ok(None)` means the caller cancelled.
    async fn open_response(
        &self,
        body: &Value,
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<reqwest::Response>, LlmError> {
        let provider = &self.provider_def.id;
        let mut attempt: u32 = 0;
        loop {
            let send = self.build_request(body, options).send();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = send => result,
            };

            let err = match result {
                Ok(res) if res.status().is_success() => return Ok(Some(res)),
                Ok(res) => {
                    let status = res.status().as_u16();
                    LlmError::from_status(provider, status, res.text().await.unwrap_or_default())
                }
                // The URL may carry the API key as a query parameter.
                Err(e) => LlmError::transport(provider, e.without_url().to_string()),
            };

            if !err.is_retryable() || attempt >= options.max_retries {
                return Err(err);
            }
            attempt += 1;
            let delay = retry_delay(attempt);
            warn!(
                "{} stream open failed ({}); retry {}/{} in {:?}",
                self.provider_def.name, err, attempt, options.max_retries, delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1 << attempt.saturating_sub(1).min(6));
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(exp + jitter)
}

fn openai_request<'a>(messages: &'a [ChatMessage], options: &'a StreamOptions) -> OpenAiRequest<'a> {
    OpenAiRequest {
        model: &options.model,
        messages: messages
            .iter()
            .map(|m| OpenAiMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect(),
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        stream: true,
    }
}

fn anthropic_request<'a>(
    messages: &'a [ChatMessage],
    options: &'a StreamOptions,
) -> AnthropicRequest<'a> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    AnthropicRequest {
        model: &options.model,
        system: (!system.is_empty()).then(|| system.join("\n")),
        messages: messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| OpenAiMessage {
                role: if m.role == "assistant" { "assistant" } else { "user" },
                content: &m.content,
            })
            .collect(),
        max_tokens: options.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        temperature: options.temperature,
        stream: true,
    }
}

fn gemini_request(messages: &[ChatMessage], options: &StreamOptions) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = Vec::new();
    let mut system_instruction: Option<GeminiContent> = None;

    // Leading system messages become system_instruction; later ones are sent as [SYSTEM] user text.
    let mut past_first_non_system = false;

    for m in messages {
        let (role, text) = if m.role == "system" && !past_first_non_system {
            match system_instruction.as_mut().and_then(|si| si.parts.first_mut()) {
                Some(part) => {
                    part.text.push('\n');
                    part.text.push_str(&m.content);
                }
                None => {
                    system_instruction = Some(GeminiContent {
                        role: "user".to_string(),
                        parts: vec![GeminiPart {
                            text: m.content.clone(),
                        }],
                    });
                }
            }
            continue;
        } else if m.role == "system" {
            ("user", format!("[SYSTEM] {}", m.content))
        } else {
            past_first_non_system = true;
            let role = if m.role == "assistant" { "model" } else { "user" };
            (role, m.content.clone())
        };

        // Gemini requires strictly alternating roles. Merge consecutive same-role entries.
        if let Some(last) = contents.last_mut()
            && last.role == role
            && let Some(part) = last.parts.first_mut()
        {
            part.text.push('\n');
            part.text.push_str(&text);
        } else {
            contents.push(GeminiContent {
                role: role.to_string(),
                parts: vec![GeminiPart { text }],
            });
        }
    }

    GeminiRequest {
        system_instruction,
        contents,
        generation_config: GeminiGenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
        },
    }
}

/// Maps one SSE event to the chunk content for the provider's wire format.
pub(crate) fn decode_event(
    format: ApiFormat,
    provider: &str,
    event: &SseEvent,
) -> Result<Decoded, LlmError> {
    let data = event.data.trim();
    if data.is_empty() {
        return Ok(Decoded::Skip);
    }
    if data == "[DONE]" {
        return Ok(Decoded::Done);
    }

    let json: Value = serde_json::from_str(data)
        .map_err(|e| LlmError::malformed(provider, format!("{} in {:?}", e, data)))?;

    if json.get("type").and_then(Value::as_str) == Some("error") || json.get("error").is_some() {
        let message = json
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| json["error"].to_string());
        return Err(LlmError::transport(provider, message));
    }

    let content = match format {
        ApiFormat::Openai => json.pointer("/choices/0/delta/content").cloned(),
        ApiFormat::Gemini => json.pointer("/candidates/0/content/parts").cloned(),
        ApiFormat::Anthropic => match json.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => json.get("delta").cloned(),
            Some("message_stop") => return Ok(Decoded::Done),
            _ => None,
        },
    };
    Ok(content.map_or(Decoded::Skip, Decoded::Chunk))
}

#[async_trait]
impl LlmProvider for GenericProvider {
    fn provider_id(&self) -> &str {
        &self.provider_def.id
    }

    fn default_model(&self) -> &str {
        &self.endpoint.model
    }

    async fn open_chunks(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let body = self.request_body(messages, options);
        debug!(
            "Opening {} stream (model {}, {} messages)",
            self.provider_def.name,
            options.model,
            messages.len()
        );

        let Some(response) = self.open_response(&body, options, cancel).await? else {
            debug!("{} stream cancelled before it opened", self.provider_def.name);
            return Ok(Box::pin(futures_stream::empty()));
        };

        let provider = self.provider_def.id.clone();
        let format = self.provider_def.api_format;
        let body = response.bytes_stream().map_err(reqwest::Error::without_url);
        let mut events = Box::pin(sse_events(Box::pin(body)));

        Ok(Box::pin(stream! {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(LlmError::transport(&provider, e.to_string()));
                        break;
                    }
                };
                match decode_event(format, &provider, &event) {
                    Ok(Decoded::Chunk(content)) => yield Ok(ProviderChunk::new(content)),
                    Ok(Decoded::Skip) => {}
                    Ok(Decoded::Done) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
            debug!("{} stream closed", provider);
        }))
    }
}
