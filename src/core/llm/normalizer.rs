//! Turns provider chunk streams into plain text deltas.
//!
//! Providers disagree on where the generated text lives inside a chunk. Every adapter hands the
//! normalizer the chunk's `content` value and the shape is resolved here, in a fixed order:
//!
//! 1. a string is the delta itself;
//! 2. an array is a list of parts, each a string or an object with a `text` field, joined in order;
//! 3. an object with a `text` field carries the delta in that field;
//! 4. anything else contributes nothing.
//!
//! Empty deltas are never yielded.

use std::pin::Pin;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::LlmError;

/// One provider-native chunk, reduced to the value that holds its generated content.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderChunk {
    pub content: Value,
}

impl ProviderChunk {
    pub fn new(content: Value) -> Self {
        Self { content }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, LlmError>> + Send>>;
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkContent<'a> {
    Text(&'a str),
    Parts(&'a [Value]),
    Keyed(&'a Value),
    Unrecognized,
}

impl<'a> ChunkContent<'a> {
    pub fn classify(content: &'a Value) -> Self {
        match content {
            Value::String(s) => ChunkContent::Text(s),
            Value::Array(parts) => ChunkContent::Parts(parts),
            Value::Object(map) => match map.get("text") {
                Some(text) => ChunkContent::Keyed(text),
                None => ChunkContent::Unrecognized,
            },
            _ => ChunkContent::Unrecognized,
        }
    }

    pub fn text(&self) -> String {
        match self {
            ChunkContent::Text(s) => (*s).to_string(),
            ChunkContent::Parts(parts) => parts.iter().filter_map(part_text).collect(),
            ChunkContent::Keyed(text) => coerce_text(text).unwrap_or_default(),
            ChunkContent::Unrecognized => String::new(),
        }
    }
}

fn part_text(part: &Value) -> Option<String> {
    match part {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("text").and_then(coerce_text),
        _ => None,
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The delta carried by `content`, or `None` when there is no text to show.
pub fn extract_text(content: &Value) -> Option<String> {
    let text = ChunkContent::classify(content).text();
    (!text.is_empty()).then_some(text)
}

/// Lazily maps `chunks` to text deltas. When `cancel` fires the sequence ends quietly; transport
/// errors are passed through and end the sequence.
pub fn normalize(mut chunks: ChunkStream, cancel: CancellationToken) -> TextStream {
    Box::pin(stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stream cancelled by caller");
                    break;
                }
                next = chunks.next() => next,
            };
            match next {
                None => break,
                Some(Ok(chunk)) => {
                    if let Some(text) = extract_text(&chunk.content) {
                        yield Ok(text);
                    }
                }
                Some(Err(e)) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

/// Drains a text stream into one string. Cancellation ends collection normally.
pub async fn collect_text(mut stream: TextStream) -> Result<String, LlmError> {
    let mut out = String::new();
    while let Some(delta) = stream.next().await {
        out.push_str(&delta?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::time::Duration;

    fn chunks(values: Vec<Value>) -> ChunkStream {
        Box::pin(stream::iter(
            values.into_iter().map(|v| Ok(ProviderChunk::new(v))),
        ))
    }

    async fn drain(stream: TextStream) -> Vec<Result<String, LlmError>> {
        stream.collect().await
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(extract_text(&json!("Hel")), Some("Hel".into()));
        assert_eq!(extract_text(&json!("")), None);
    }

    #[test]
    fn part_lists_are_joined_in_order() {
        let content = json!(["a", { "text": "b" }, { "type": "image" }, 7, { "text": "c" }]);
        assert_eq!(extract_text(&content), Some("abc".into()));
        assert_eq!(extract_text(&json!([{ "type": "image" }])), None);
        assert_eq!(extract_text(&json!([])), None);
    }

    #[test]
    fn keyed_text_is_coerced() {
        assert_eq!(extract_text(&json!({ "text": "hi" })), Some("hi".into()));
        assert_eq!(extract_text(&json!({ "text": 42 })), Some("42".into()));
        assert_eq!(extract_text(&json!({ "text": null })), None);
        assert_eq!(extract_text(&json!({ "text": "" })), None);
    }

    #[test]
    fn other_shapes_yield_nothing() {
        for v in [
            json!(null),
            json!(3),
            json!(true),
            json!({ "content": "nested" }),
            json!({ "partial_json": "{\"a\":" }),
        ] {
            assert_eq!(extract_text(&v), None, "{v} should be ignored");
        }
    }

    #[test]
    fn classification_order_is_fixed() {
        assert!(matches!(ChunkContent::classify(&json!("x")), ChunkContent::Text("x")));
        assert!(matches!(ChunkContent::classify(&json!([])), ChunkContent::Parts(_)));
        assert!(matches!(
            ChunkContent::classify(&json!({ "text": "x" })),
            ChunkContent::Keyed(_)
        ));
        assert_eq!(ChunkContent::classify(&json!({})), ChunkContent::Unrecognized);
    }

    #[tokio::test]
    async fn mixed_stream_yields_only_non_empty_deltas() {
        let input = chunks(vec![
            json!("Hello"),
            json!(""),
            json!([", ", { "text": "wor" }]),
            json!({ "unexpected": true }),
            json!({ "text": "ld" }),
            json!(null),
        ]);
        let out: Vec<String> = drain(normalize(input, CancellationToken::new()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(out, vec!["Hello", ", wor", "ld"]);
    }

    #[tokio::test]
    async fn transport_errors_end_the_stream_after_earlier_deltas() {
        let input: ChunkStream = Box::pin(stream::iter(vec![
            Ok(ProviderChunk::new(json!("partial"))),
            Err(LlmError::transport("openai", "connection reset")),
            Ok(ProviderChunk::new(json!("never"))),
        ]));
        let out = drain(normalize(input, CancellationToken::new())).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "partial");
        assert!(matches!(out[1], Err(LlmError::Transport { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_mid_stream_stops_quietly() {
        let cancel = CancellationToken::new();
        let slow: ChunkStream = Box::pin(
            stream::iter((0..10).map(|i| Ok(ProviderChunk::new(json!(format!("t{}", i))))))
                .then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    chunk
                }),
        );

        let mut text = normalize(slow, cancel.clone());
        assert_eq!(text.next().await.unwrap().unwrap(), "t0");
        assert_eq!(text.next().await.unwrap().unwrap(), "t1");
        cancel.cancel();
        assert!(text.next().await.is_none());
        assert!(text.next().await.is_none());
    }

    #[tokio::test]
    async fn already_cancelled_token_yields_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = drain(normalize(chunks(vec![json!("x")]), cancel)).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn collect_joins_deltas() {
        let text = normalize(
            chunks(vec![json!("a"), json!({ "text": "b" })]),
            CancellationToken::new(),
        );
        assert_eq!(collect_text(text).await.unwrap(), "ab");
    }
}
