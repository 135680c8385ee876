//! Line framer and event decoder for the chat service's event stream.
//!
//! The service writes one JSON payload per `data: ` line. Chunks from the
//! transport may split a line (or a UTF-8 sequence) anywhere, so the framer
//! buffers raw bytes and only decodes lines once their `\n` has arrived.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use dc_protocol::{FileEvent, StreamEvent, ThoughtEvent};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Marker prefix of data-carrying lines.
const DATA_PREFIX: &str = "data: ";

/// Reassembles byte chunks into lines and dispatches decoded events.
///
/// Owned by exactly one stream. `\n` is ASCII and never appears inside a
/// multi-byte UTF-8 sequence, so splitting on it before decoding is safe for
/// any chunking.
#[derive(Debug, Default)]
pub struct StreamFramer {
    /// Bytes after the last line break seen so far.
    buf: Vec<u8>,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Every complete line it terminates is decoded and
    /// dispatched in order; the unterminated tail stays buffered.
    pub fn push(&mut self, chunk: &[u8], mut dispatch: impl FnMut(StreamEvent)) {
        // Only the new bytes can hold a line break; the buffered tail has none.
        let start = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let Some(last_break) = chunk
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| start + i)
        else {
            return;
        };
        let tail = self.buf.split_off(last_break + 1);
        let complete = std::mem::replace(&mut self.buf, tail);

        for line in complete.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(line);
            match parse_line(&line) {
                Some(Ok(event)) => dispatch_known(event, &mut dispatch),
                Some(Err(e)) => {
                    warn!("failed to decode stream line: {e}");
                    dispatch(StreamEvent::Error(decode_failure(&e)));
                }
                None => {}
            }
        }
    }

    /// End of stream. The unterminated tail gets one parse attempt; it is
    /// dispatched only if it decodes cleanly, since a cut-off line is expected
    /// when the connection closes mid-write.
    pub fn finish(&mut self, mut dispatch: impl FnMut(StreamEvent)) {
        let rest = std::mem::take(&mut self.buf);
        if rest.is_empty() {
            return;
        }

        let line = String::from_utf8_lossy(&rest);
        match parse_line(&line) {
            Some(Ok(event)) => dispatch_known(event, &mut dispatch),
            Some(Err(e)) => debug!("dropping truncated trailing line: {e}"),
            None => {}
        }
    }

    /// Bytes currently held back waiting for a line break.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn dispatch_known(event: StreamEvent, dispatch: &mut impl FnMut(StreamEvent)) {
    if let StreamEvent::Unknown { event, .. } = &event {
        debug!("ignoring unhandled event type: {event:?}");
        return;
    }
    dispatch(event);
}

fn decode_failure(e: &serde_json::Error) -> String {
    format!("failed to decode stream line: {e}")
}

/// Extract the payload of a data line. `None` for framing noise and
/// keep-alives.
fn data_payload(line: &str) -> Option<&str> {
    let payload = line.trim().strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

fn parse_line(line: &str) -> Option<Result<StreamEvent, serde_json::Error>> {
    data_payload(line).map(decode_payload)
}

/// Decode one logical line.
///
/// Returns `None` for lines that carry no event. A payload that fails to
/// decode becomes a [`StreamEvent::Error`] so the stream can carry on.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    parse_line(line)
        .map(|result| result.unwrap_or_else(|e| StreamEvent::Error(decode_failure(&e))))
}

#[derive(Deserialize)]
struct TextPayload {
    #[serde(default)]
    answer: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Decode a JSON payload by its `event` discriminator.
///
/// A known discriminator with mistyped fields is an error. Anything without a
/// recognised discriminator decodes to [`StreamEvent::Unknown`].
pub fn decode_payload(payload: &str) -> Result<StreamEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(payload)?;
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let decoded = match event.as_str() {
        "message" | "agent_message" => {
            let text: TextPayload = serde_json::from_value(value)?;
            StreamEvent::Text {
                answer: text.answer,
            }
        }
        "agent_thought" => {
            let thought: ThoughtEvent = serde_json::from_value(value)?;
            StreamEvent::Thought(thought)
        }
        "message_file" => {
            let file: FileEvent = serde_json::from_value(value)?;
            StreamEvent::File(file)
        }
        "message_end" => StreamEvent::End { tts: false },
        "tts_message_end" => StreamEvent::End { tts: true },
        "error" => {
            let err: ErrorPayload = serde_json::from_value(value)?;
            let reason = err
                .error
                .filter(|s| !s.is_empty())
                .or(err.message.filter(|s| !s.is_empty()))
                .unwrap_or_else(|| "stream error".to_string());
            StreamEvent::Error(reason)
        }
        _ => StreamEvent::Unknown {
            event,
            payload: value,
        },
    };

    Ok(decoded)
}

/// Stream adapter that turns a byte stream into decoded events.
///
/// Yields events in wire order. The first transport error is yielded once and
/// ends the stream; buffered bytes are never parsed after it.
pub struct EventStream<S> {
    inner: S,
    framer: StreamFramer,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl<S> EventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            framer: StreamFramer::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for EventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<StreamEvent, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    debug!(
                        "stream chunk: {} bytes ({} buffered)",
                        bytes.len(),
                        this.framer.pending_len()
                    );
                    let pending = &mut this.pending;
                    this.framer.push(&bytes, |event| pending.push_back(event));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    let pending = &mut this.pending;
                    this.framer.finish(|event| pending.push_back(event));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Create an event stream from a byte stream.
pub fn parse_event_stream<S, E>(stream: S) -> EventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    EventStream::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn bytes_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        futures::stream::iter(chunks.into_iter().map(|s| Ok(Bytes::from(s))))
    }

    fn collect_pushed<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<StreamEvent> {
        let mut framer = StreamFramer::new();
        let mut events = Vec::new();
        for chunk in chunks {
            framer.push(chunk.as_ref(), |e| events.push(e));
        }
        framer.finish(|e| events.push(e));
        events
    }

    #[test]
    fn long_line_in_small_chunks() {
        let answer = "x".repeat(200_000);
        let wire = format!("data: {{\"event\":\"agent_message\",\"answer\":\"{answer}\"}}\n\n");

        let mut framer = StreamFramer::new();
        let mut events = Vec::new();
        for chunk in wire.as_bytes().chunks(64) {
            framer.push(chunk, |e| events.push(e));
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0], StreamEvent::Text { answer: Some(answer) });
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn tail_kept_until_break_arrives() {
        let mut framer = StreamFramer::new();
        let mut events = Vec::new();

        framer.push(b"data: {\"event\":\"agent_", |e| events.push(e));
        framer.push(b"message\",\"answer\":\"a\"}", |e| events.push(e));
        assert!(events.is_empty());
        assert_eq!(framer.pending_len(), 44);

        framer.push(b"\ndata: {\"ev", |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert_eq!(framer.pending_len(), 10);
    }

    fn text(s: &str) -> StreamEvent {
        StreamEvent::Text {
            answer: Some(s.to_string()),
        }
    }

    #[test]
    fn decode_text_events() {
        let line = r#"data: {"event":"agent_message","answer":"Hi"}"#;
        assert_eq!(decode_line(line), Some(text("Hi")));

        let line = r#"data: {"event":"message","answer":"there"}"#;
        assert_eq!(decode_line(line), Some(text("there")));
    }

    #[test]
    fn decode_text_without_answer() {
        let line = r#"data: {"event":"message"}"#;
        assert_eq!(decode_line(line), Some(StreamEvent::Text { answer: None }));
    }

    #[test]
    fn decode_thought_event() {
        let line = r#"data: {"event":"agent_thought","id":"t1","position":1,"thought":"check","tool":"","message_files":["f1"]}"#;
        let Some(StreamEvent::Thought(thought)) = decode_line(line) else {
            panic!("expected thought");
        };
        assert_eq!(thought.id, "t1");
        assert_eq!(thought.position, Some(1));
        assert_eq!(thought.thought.as_deref(), Some("check"));
        assert_eq!(thought.tool.as_deref(), Some(""));
        assert_eq!(thought.message_files, Some(vec!["f1".to_string()]));
    }

    #[test]
    fn decode_file_event() {
        let line = r#"data: {"event":"message_file","id":"f1","type":"image","url":"http://x"}"#;
        assert_eq!(
            decode_line(line),
            Some(StreamEvent::File(FileEvent {
                id: "f1".to_string(),
                file_type: "image".to_string(),
                url: "http://x".to_string(),
            }))
        );
    }

    #[test]
    fn decode_end_events() {
        assert_eq!(
            decode_line(r#"data: {"event":"message_end","id":"m1"}"#),
            Some(StreamEvent::End { tts: false })
        );
        assert_eq!(
            decode_line(r#"data: {"event":"tts_message_end","audio":""}"#),
            Some(StreamEvent::End { tts: true })
        );
    }

    #[test]
    fn decode_error_event_reason() {
        assert_eq!(
            decode_line(r#"data: {"event":"error","error":"quota exceeded"}"#),
            Some(StreamEvent::Error("quota exceeded".to_string()))
        );
        assert_eq!(
            decode_line(r#"data: {"event":"error","status":400,"code":"invalid_param","message":"bad input"}"#),
            Some(StreamEvent::Error("bad input".to_string()))
        );
        assert_eq!(
            decode_line(r#"data: {"event":"error","error":""}"#),
            Some(StreamEvent::Error("stream error".to_string()))
        );
    }

    #[test]
    fn decode_unknown_event_keeps_payload() {
        let Some(StreamEvent::Unknown { event, payload }) =
            decode_line(r#"data: {"event":"workflow_started","task_id":"x"}"#)
        else {
            panic!("expected unknown");
        };
        assert_eq!(event, "workflow_started");
        assert_eq!(payload["task_id"], "x");
    }

    #[test]
    fn decode_payload_without_discriminator() {
        let event = decode_payload("42").unwrap();
        assert!(matches!(event, StreamEvent::Unknown { ref event, .. } if event.is_empty()));
    }

    #[test]
    fn decode_malformed_json_is_error_event() {
        let Some(StreamEvent::Error(reason)) = decode_line("data: {not json") else {
            panic!("expected error");
        };
        assert!(reason.starts_with("failed to decode stream line"));
    }

    #[test]
    fn decode_mistyped_known_event_is_error_event() {
        let line = r#"data: {"event":"agent_thought","id":7}"#;
        assert!(matches!(decode_line(line), Some(StreamEvent::Error(_))));
    }

    #[test]
    fn framing_noise_is_ignored() {
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("   "), None);
        assert_eq!(decode_line(": ping"), None);
        assert_eq!(decode_line("event: message"), None);
        assert_eq!(decode_line("id: 5"), None);
        assert_eq!(decode_line("data: "), None);
        assert_eq!(decode_line("data:    "), None);
    }

    #[test]
    fn leading_whitespace_before_marker() {
        let line = r#"   data: {"event":"message","answer":"x"}  "#;
        assert_eq!(decode_line(line), Some(text("x")));
    }

    #[test]
    fn push_keeps_incomplete_tail() {
        let mut framer = StreamFramer::new();
        let mut events = Vec::new();
        framer.push(br#"data: {"event":"message","ans"#, |e| events.push(e));
        assert!(events.is_empty());
        assert!(framer.pending_len() > 0);

        framer.push(b"wer\":\"ok\"}\n", |e| events.push(e));
        assert_eq!(events, vec![text("ok")]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn many_lines_in_one_chunk() {
        let events = collect_pushed(&[concat!(
            "data: {\"event\":\"message\",\"answer\":\"a\"}\n\n",
            ": keep-alive\n",
            "data: {\"event\":\"message\",\"answer\":\"b\"}\n\n",
        )
        .as_bytes()]);
        assert_eq!(events, vec![text("a"), text("b")]);
    }

    #[test]
    fn malformed_line_does_not_stop_later_lines() {
        let events = collect_pushed(&[concat!(
            "data: {\"event\":\"message\",\"answer\":\"a\"}\n",
            "data: {broken\n",
            "data: {\"event\":\"message\",\"answer\":\"b\"}\n",
        )
        .as_bytes()]);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], text("a"));
        assert!(matches!(events[1], StreamEvent::Error(_)));
        assert_eq!(events[2], text("b"));
    }

    #[test]
    fn unknown_events_are_not_dispatched() {
        let events = collect_pushed(&[concat!(
            "data: {\"event\":\"ping\"}\n",
            "data: {\"event\":\"message\",\"answer\":\"a\"}\n",
        )
        .as_bytes()]);
        assert_eq!(events, vec![text("a")]);
    }

    #[test]
    fn crlf_line_endings() {
        let events = collect_pushed(&[b"data: {\"event\":\"message\",\"answer\":\"a\"}\r\n\r\n"]);
        assert_eq!(events, vec![text("a")]);
    }

    #[test]
    fn split_anywhere_invariance() {
        let wire = concat!(
            "data: {\"event\":\"agent_message\",\"answer\":\"héllo → 世界 🦀\"}\n\n",
            "data: {\"event\":\"agent_thought\",\"id\":\"t1\",\"thought\":\"检查\"}\n\n",
            ": comment\n",
            "data: {\"event\":\"message_file\",\"id\":\"f1\",\"type\":\"image\",\"url\":\"http://x\"}\n\n",
            "data: {\"event\":\"message_end\"}\n\n",
        )
        .as_bytes();

        let whole = collect_pushed(&[wire]);
        assert_eq!(whole.len(), 4);

        // Every two-way split, including inside multi-byte characters.
        for at in 0..=wire.len() {
            let (a, b) = wire.split_at(at);
            assert_eq!(collect_pushed(&[a, b]), whole, "split at byte {at}");
        }

        // Byte-at-a-time delivery.
        let singles: Vec<&[u8]> = wire.chunks(1).collect();
        assert_eq!(collect_pushed(&singles), whole);
    }

    #[test]
    fn trailing_line_without_break_is_parsed() {
        let events = collect_pushed(&[br#"data: {"event":"message","answer":"last"}"#]);
        assert_eq!(events, vec![text("last")]);
    }

    #[test]
    fn truncated_trailing_line_is_dropped() {
        let events = collect_pushed(&[
            b"data: {\"event\":\"message\",\"answer\":\"a\"}\n".as_slice(),
            br#"data: {"event":"message","ans"#.as_slice(),
        ]);
        assert_eq!(events, vec![text("a")]);
    }

    #[tokio::test]
    async fn event_stream_chunked_data() {
        let stream = bytes_stream(vec![
            "data: {\"event\":\"mes",
            "sage\",\"answer\":\"hel",
            "lo\"}\n\ndata: {\"event\":\"message_end\"}\n\n",
        ]);
        let events: Vec<_> = parse_event_stream(stream)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(events, vec![text("hello"), StreamEvent::End { tts: false }]);
    }

    #[tokio::test]
    async fn event_stream_empty_body() {
        let mut events = parse_event_stream(bytes_stream(vec![]));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn event_stream_stops_at_transport_error() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from("data: {\"event\":\"message\",\"answer\":\"a\"}\n")),
            // Complete payload but no line break: must not be parsed.
            Ok(Bytes::from("data: {\"event\":\"message\",\"answer\":\"b\"}")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from("data: {\"event\":\"message\",\"answer\":\"c\"}\n")),
        ];
        let mut events = parse_event_stream(futures::stream::iter(chunks));

        assert_eq!(events.next().await.unwrap().unwrap(), text("a"));
        let err = events.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn event_stream_error_before_data() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))];
        let results: Vec<_> = parse_event_stream(futures::stream::iter(chunks))
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
