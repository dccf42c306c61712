//! HTTP transport and buffered NDJSON decoding.
//!
//! Providers that stream newline-delimited JSON can split an object
//! across TCP chunk boundaries; [`NdjsonDecoder`] buffers raw bytes and
//! yields only complete lines. [`HttpTransport`] turns a POST request
//! into a [`RawStream`] of decoded wire events for a
//! [`ProviderAdapter`](crate::provider::ProviderAdapter) to map.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Stream of decoded provider wire events (one JSON value per event).
pub type RawStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Buffered decoder for newline-delimited JSON streams (NDJSON).
///
/// # Example
///
/// ```
/// use completion_pipeline::transport::NdjsonDecoder;
///
/// let mut decoder = NdjsonDecoder::new();
///
/// // First chunk: partial JSON
/// let values = decoder.decode(b"{\"type\":");
/// assert!(values.is_empty());
///
/// // Second chunk: completes the line
/// let values = decoder.decode(b"\"done\"}\n");
/// assert_eq!(values.len(), 1);
/// assert_eq!(values[0]["type"], "done");
/// ```
#[derive(Default)]
pub struct NdjsonDecoder {
    buffer: String,
}

impl NdjsonDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk and return any complete JSON lines.
    ///
    /// Incomplete lines are buffered until the next chunk arrives.
    /// Non-JSON lines are skipped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        let text = String::from_utf8_lossy(chunk);
        self.buffer.push_str(&text);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(val) = serde_json::from_str::<Value>(line) {
                values.push(val);
            }
        }
        values
    }

    /// Parse any trailing data not terminated by a newline.
    ///
    /// Call this after the byte stream ends.
    pub fn flush(&mut self) -> Option<Value> {
        let remaining = self.buffer.trim().to_string();
        self.buffer.clear();
        if remaining.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(&remaining).ok()
    }
}

/// Thin HTTP client wrapper for NDJSON-streaming provider endpoints.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Create a transport reusing an existing client (connection pools).
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body and stream back decoded NDJSON events.
    ///
    /// Non-success statuses become [`PipelineError::HttpError`] with the
    /// response body and any `Retry-After` header, so the backoff layer
    /// can classify them.
    pub async fn post_stream(&self, path: &str, body: &Value) -> Result<RawStream> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let resp = self.client.post(&url).json(body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::HttpError {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let state = (resp.bytes_stream().boxed(), NdjsonDecoder::new(), VecDeque::new(), false);
        let events = stream::unfold(state, |(mut bytes, mut decoder, mut queue, mut done)| async move {
            loop {
                if let Some(item) = queue.pop_front() {
                    return Some((item, (bytes, decoder, queue, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        queue.extend(decoder.decode(&chunk).into_iter().map(Ok));
                    }
                    Some(Err(e)) => queue.push_back(Err(PipelineError::Request(e))),
                    None => {
                        done = true;
                        if let Some(trailing) = decoder.flush() {
                            queue.push_back(Ok(trailing));
                        }
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}

/// Parse a `Retry-After` header value as integer seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_lines() {
        let mut decoder = NdjsonDecoder::new();
        let values = decoder.decode(b"{\"type\":\"text_delta\"}\n{\"type\":\"done\"}\n");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["type"], "text_delta");
        assert_eq!(values[1]["type"], "done");
    }

    #[test]
    fn test_split_mid_value() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.decode(b"{\"text\":\"hel").is_empty());
        assert!(decoder.decode(b"lo wor").is_empty());
        let values = decoder.decode(b"ld\"}\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["text"], "hello world");
    }

    #[test]
    fn test_chunk_crossing_line_boundary() {
        let mut decoder = NdjsonDecoder::new();
        let v1 = decoder.decode(b"{\"a\":1}\n{\"b\":");
        assert_eq!(v1.len(), 1);
        assert_eq!(v1[0]["a"], 1);

        let v2 = decoder.decode(b"2}\n");
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0]["b"], 2);
    }

    #[test]
    fn test_flush_trailing_line() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.decode(b"{\"type\":\"done\"}").is_empty());
        assert_eq!(decoder.flush(), Some(json!({"type": "done"})));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn test_non_json_lines_skipped() {
        let mut decoder = NdjsonDecoder::new();
        let values = decoder.decode(b"not json\n{\"ok\":true}\ngarbage\n");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["ok"], json!(true));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct"), None);
    }
}
