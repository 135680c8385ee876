//! Mock transport for testing.
//!
//! Produces the same wire bytes the real service sends, so tests at every layer
//! exercise the framer instead of bypassing it.

use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use dc_protocol::{ChatRequest, ThoughtEvent};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::transport::{ByteStream, Transport, TransportError};

/// Configurable mock responses for testing.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Emit one `data: {payload}` line followed by a blank line.
    Event(Value),
    /// Emit raw bytes as one chunk, without any framing.
    Raw(Vec<u8>),
    /// Fail the transport. Nothing after this is sent.
    Fail { message: String },
    /// Delay before next chunk (for timing tests).
    Delay { ms: u64 },
}

impl MockResponse {
    pub fn text(answer: &str) -> Self {
        Self::Event(json!({ "event": "agent_message", "answer": answer }))
    }

    pub fn thought(thought: &ThoughtEvent) -> Self {
        let mut payload = serde_json::to_value(thought).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut payload {
            map.insert("event".to_string(), json!("agent_thought"));
        }
        Self::Event(payload)
    }

    pub fn file(id: &str, file_type: &str, url: &str) -> Self {
        Self::Event(json!({
            "event": "message_file",
            "id": id,
            "type": file_type,
            "url": url,
            "belongs_to": "assistant",
        }))
    }

    pub fn end() -> Self {
        Self::Event(json!({ "event": "message_end" }))
    }

    pub fn error(message: &str) -> Self {
        Self::Event(json!({ "event": "error", "error": message }))
    }

    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self::Raw(data.into())
    }
}

/// Configuration for a mock stream.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Sequence of responses to emit.
    pub responses: Vec<MockResponse>,
    /// Re-split the framed output into chunks of this many bytes.
    pub chunk_size: Option<usize>,
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(mut self, responses: Vec<MockResponse>) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }
}

fn frame(response: &MockResponse) -> Option<Vec<u8>> {
    match response {
        MockResponse::Event(payload) => Some(format!("data: {payload}\n\n").into_bytes()),
        MockResponse::Raw(data) => Some(data.clone()),
        MockResponse::Fail { .. } | MockResponse::Delay { .. } => None,
    }
}

/// Create a byte stream from a mock config.
pub fn mock_stream(config: MockConfig) -> ByteStream {
    Box::pin(stream! {
        for response in config.responses {
            match response {
                MockResponse::Fail { message } => {
                    yield Err(TransportError::Io(message));
                    return;
                }
                MockResponse::Delay { ms } => {
                    sleep(Duration::from_millis(ms)).await;
                    // Delay doesn't emit a chunk
                }
                other => {
                    let Some(bytes) = frame(&other) else { continue };
                    match config.chunk_size {
                        Some(size) => {
                            for piece in bytes.chunks(size) {
                                yield Ok(Bytes::copy_from_slice(piece));
                            }
                        }
                        None => yield Ok(Bytes::from(bytes)),
                    }
                }
            }
        }
    })
}

/// A [`Transport`] that replays the same script for every request and records
/// what it was asked.
#[derive(Debug, Default)]
pub struct MockTransport {
    config: MockConfig,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Transport for MockTransport {
    fn open_stream(&self, request: &ChatRequest) -> ByteStream {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        mock_stream(self.config.clone())
    }
}

/// Built-in test fixtures for common scenarios.
pub mod fixtures {
    use super::*;

    /// A plain answer streamed in pieces, then `message_end`.
    pub fn streaming_text(chunks: &[&str]) -> MockConfig {
        let mut responses: Vec<MockResponse> =
            chunks.iter().map(|chunk| MockResponse::text(chunk)).collect();
        responses.push(MockResponse::end());

        MockConfig::new().with_responses(responses)
    }

    /// Text, one thought, one file, end.
    pub fn agent_answer() -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::text("Hi"),
            MockResponse::thought(&ThoughtEvent::new("t1").with_thought("check")),
            MockResponse::file("f1", "image", "http://x"),
            MockResponse::end(),
        ])
    }

    /// A thought that is revised as the tool call completes.
    pub fn revised_thought() -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::thought(
                &ThoughtEvent::new("t1")
                    .with_position(1)
                    .with_thought("I should search"),
            ),
            MockResponse::thought(
                &ThoughtEvent::new("t1")
                    .with_position(1)
                    .with_tool("search", r#"{"q":"weather"}"#),
            ),
            MockResponse::thought(
                &ThoughtEvent::new("t1")
                    .with_position(1)
                    .with_observation("sunny"),
            ),
            MockResponse::text("It is sunny."),
            MockResponse::end(),
        ])
    }

    /// Text followed by an in-band error event.
    pub fn error_mid_stream(text_before: &str, error: &str) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::text(text_before),
            MockResponse::error(error),
        ])
    }

    /// Text, then the connection drops.
    pub fn dropped_connection(text_before: &str) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::text(text_before),
            MockResponse::Fail {
                message: "connection reset".to_string(),
            },
        ])
    }

    /// The connection fails before any data.
    pub fn connection_refused() -> MockConfig {
        MockConfig::new().with_responses(vec![MockResponse::Fail {
            message: "connection refused".to_string(),
        }])
    }
}
