//! Stream events decoded from the chat service's `data:` lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events emitted while a response is streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of answer text (`message` / `agent_message`).
    /// `None` when the payload carried no `answer` field.
    Text { answer: Option<String> },

    /// A reasoning or tool-use step (`agent_thought`). The same `id` may be
    /// emitted several times as the step is revised.
    Thought(ThoughtEvent),

    /// An attachment produced by the assistant (`message_file`).
    File(FileEvent),

    /// The service finished the answer (`message_end`, or `tts_message_end`
    /// when `tts` is set). Informational only.
    End { tts: bool },

    /// The service, or the line decoder, reported a failure.
    Error(String),

    /// Any discriminator we don't consume. Carries the raw payload.
    Unknown { event: String, payload: Value },
}

impl StreamEvent {
    /// Wire discriminator for this event, as it appeared in the payload's
    /// `event` field (the first alias for merged variants).
    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::Text { .. } => "agent_message",
            StreamEvent::Thought(_) => "agent_thought",
            StreamEvent::File(_) => "message_file",
            StreamEvent::End { tts: false } => "message_end",
            StreamEvent::End { tts: true } => "tts_message_end",
            StreamEvent::Error(_) => "error",
            StreamEvent::Unknown { event, .. } => event,
        }
    }
}

/// Payload of an `agent_thought` event. Every field except `id` may be absent
/// on a partial revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtEvent {
    pub id: String,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub tool_input: Option<String>,
    #[serde(default)]
    pub message_files: Option<Vec<String>>,
}

impl ThoughtEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = Some(observation.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, tool_input: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self.tool_input = Some(tool_input.into());
        self
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }
}

/// Payload of a `message_file` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub id: String,
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub url: String,
}
