use std::io;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use tokio::io::AsyncBufReadExt;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Decodes a `text/event-stream` body into events. Comment lines and `id`/`retry` fields are
/// ignored; multi-line `data` fields are joined with `\n`.
pub fn sse_events<S, E>(body: S) -> impl Stream<Item = io::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        let reader = tokio_util::io::StreamReader::new(body.map_err(io::Error::other));
        let mut buf_reader = tokio::io::BufReader::new(reader);
        let mut line_buf = String::new();
        let mut event: Option<String> = None;
        let mut data: Vec<String> = Vec::new();

        loop {
            line_buf.clear();
            let read = buf_reader.read_line(&mut line_buf).await?;
            let line = line_buf.trim_end_matches(['\r', '\n']);

            if read == 0 || line.is_empty() {
                if !data.is_empty() {
                    yield SseEvent {
                        event: event.take(),
                        data: data.join("\n"),
                    };
                    data.clear();
                } else {
                    event = None;
                }
                if read == 0 {
                    break;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value.to_string()),
                _ => {}
            }
        }
    }
}
