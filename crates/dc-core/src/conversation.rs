//! Conversation state and the reducer that folds stream events into it.
//!
//! A send appends the user's message and an empty assistant message, then
//! applies every decoded event to that assistant message (the streaming
//! target) until the stream ends. State is renderable after every event.

use dc_backend::{parse_event_stream, Transport};
use dc_protocol::{
    ChatRequest, FileEvent, FileRef, Message, Role, StreamEvent, Thought, ThoughtEvent,
};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("a response is already streaming")]
    Busy,
}

/// Everything a renderer needs to draw the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationState {
    messages: Vec<Message>,
    is_loading: bool,
    error: Option<String>,
    streaming_message_id: Option<String>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn streaming_message_id(&self) -> Option<&str> {
        self.streaming_message_id.as_deref()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The assistant message currently receiving events.
    pub fn streaming_message(&self) -> Option<&Message> {
        let id = self.streaming_message_id.as_deref()?;
        self.messages.iter().find(|m| m.id == id)
    }

    /// Start a response to `text`: clear the last error, append the user
    /// message and an empty assistant message, and make the latter the
    /// streaming target. Returns the assistant message id.
    pub fn begin_stream(&mut self, text: &str) -> Result<String, ConversationError> {
        if self.streaming_message_id.is_some() {
            return Err(ConversationError::Busy);
        }

        self.error = None;
        self.messages.push(Message::user(text));

        let assistant = Message::assistant();
        let id = assistant.id.clone();
        self.messages.push(assistant);

        self.streaming_message_id = Some(id.clone());
        self.is_loading = true;
        Ok(id)
    }

    /// Terminal transition: no target, not loading. Idempotent.
    pub fn finish_stream(&mut self) {
        if let Some(id) = self.streaming_message_id.take() {
            debug!("stream finished for message {id}");
        }
        self.is_loading = false;
    }

    /// Record a failure that ended (or happened during) the stream.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
    }

    /// Apply one event to the streaming target. Returns whether any visible
    /// state changed. Without a streaming target this is a no-op.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        let Some(target) = self.streaming_message_id.as_deref() else {
            debug!("no streaming target, dropping {} event", event.kind());
            return false;
        };

        match event {
            StreamEvent::Error(reason) => {
                warn!("stream reported error: {reason}");
                self.error = Some(reason);
                true
            }
            StreamEvent::End { tts } => {
                info!("message end received (tts: {tts})");
                false
            }
            StreamEvent::Unknown { event, .. } => {
                debug!("ignoring unhandled event type: {event:?}");
                false
            }
            event => match self.messages.iter_mut().find(|m| m.id == target) {
                Some(message) => apply_to_message(message, event),
                None => {
                    warn!("streaming target {target} is gone");
                    false
                }
            },
        }
    }
}

fn apply_to_message(message: &mut Message, event: StreamEvent) -> bool {
    match event {
        StreamEvent::Text {
            answer: Some(delta),
        } => {
            message.content.push_str(&delta);
            !delta.is_empty()
        }
        StreamEvent::Thought(update) => {
            upsert_thought(&mut message.thoughts, update);
            true
        }
        StreamEvent::File(file) => {
            message.files.push(assistant_file(file));
            true
        }
        _ => false,
    }
}

fn assistant_file(file: FileEvent) -> FileRef {
    FileRef {
        id: file.id,
        file_type: file.file_type,
        url: file.url,
        belongs_to: Role::Assistant,
    }
}

/// Insert a thought, or merge into the one with the same id.
fn upsert_thought(thoughts: &mut Vec<Thought>, update: ThoughtEvent) {
    match thoughts.iter_mut().find(|t| t.id == update.id) {
        Some(existing) => merge_thought(existing, update),
        None => {
            let mut thought = Thought {
                id: update.id.clone(),
                ..Default::default()
            };
            merge_thought(&mut thought, update);
            thoughts.push(thought);
        }
    }
}

/// Overlay the fields the update actually carries. Empty values never erase
/// what an earlier revision set.
fn merge_thought(thought: &mut Thought, update: ThoughtEvent) {
    if let Some(position) = update.position {
        thought.position = position;
    }
    replace_if_present(&mut thought.thought, update.thought);
    replace_if_present(&mut thought.observation, update.observation);
    replace_if_present(&mut thought.tool, update.tool);
    replace_if_present(&mut thought.tool_input, update.tool_input);
    if let Some(files) = update.message_files.filter(|f| !f.is_empty()) {
        thought.message_files = files;
    }
}

fn replace_if_present(field: &mut String, incoming: Option<String>) {
    if let Some(value) = incoming.filter(|v| !v.is_empty()) {
        *field = value;
    }
}

/// Commits the terminal transition when the send ends, however it ends
/// (including the send future being dropped).
struct StreamGuard<'a> {
    state: &'a mut ConversationState,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.state.finish_stream();
    }
}

/// A conversation with one remote assistant, driven over a [`Transport`].
pub struct Conversation<T> {
    transport: T,
    state: ConversationState,
    user: String,
    conversation_id: Option<String>,
}

impl<T: Transport> Conversation<T> {
    pub fn new(transport: T, user: impl Into<String>) -> Self {
        Self {
            transport,
            state: ConversationState::new(),
            user: user.into(),
            conversation_id: None,
        }
    }

    /// Continue a server-side conversation instead of starting a fresh one.
    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn error(&self) -> Option<&str> {
        self.state.error()
    }

    pub fn streaming_message_id(&self) -> Option<&str> {
        self.state.streaming_message_id()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.state.last_message()
    }

    /// Apply one event to the streaming target.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        self.state.apply(event)
    }

    /// Send `text` and stream the reply into a new assistant message.
    ///
    /// Returns the assistant message id, or `None` for blank input. Stream
    /// failures don't make this fail: they land in [`Self::error`] with the
    /// partial reply kept.
    pub async fn send_message(&mut self, text: &str) -> Result<Option<String>, ConversationError> {
        self.send_message_observed(text, |_| {}).await
    }

    /// Like [`Self::send_message`], calling `observe` with the assistant
    /// message after every event that changed it, and once more on
    /// `message_end`.
    pub async fn send_message_observed<F>(
        &mut self,
        text: &str,
        mut observe: F,
    ) -> Result<Option<String>, ConversationError>
    where
        F: FnMut(&Message),
    {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let assistant_id = self.state.begin_stream(text)?;
        let request = ChatRequest::new(text, self.user.as_str())
            .with_conversation(self.conversation_id.clone());

        info!("sending message ({} chars) as {}", text.len(), self.user);
        let mut events = parse_event_stream(self.transport.open_stream(&request));
        let guard = StreamGuard {
            state: &mut self.state,
        };

        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    let ended = matches!(event, StreamEvent::End { .. });
                    if guard.state.apply(event) || ended {
                        if let Some(message) = guard.state.streaming_message() {
                            observe(message);
                        }
                    }
                }
                Err(e) => {
                    warn!("transport failed: {e}");
                    guard.state.set_error(e.to_string());
                    break;
                }
            }
        }

        drop(guard);
        info!("stream complete for message {assistant_id}");
        Ok(Some(assistant_id))
    }

    /// Drop every message and the last error.
    pub fn clear_messages(&mut self) {
        self.state.messages.clear();
        self.state.error = None;
    }

    /// Remove one message by id. Returns whether it existed.
    pub fn remove_message(&mut self, id: &str) -> bool {
        let before = self.state.messages.len();
        self.state.messages.retain(|m| m.id != id);
        self.state.messages.len() != before
    }
}
