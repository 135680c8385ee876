//! Conversation records and request/response types for the chat service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One step of the assistant's reasoning / tool-use trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thought {
    pub id: String,
    pub position: u32,
    pub thought: String,
    pub observation: String,
    pub tool: String,
    pub tool_input: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_files: Vec<String>,
}

/// A file attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub id: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub url: String,
    pub belongs_to: Role,
}

/// A message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thoughts: Vec<Thought>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// An empty assistant message, ready to be filled by a stream.
    pub fn assistant() -> Self {
        Self::new(Role::Assistant, String::new())
    }

    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            thoughts: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn thought(&self, id: &str) -> Option<&Thought> {
        self.thoughts.iter().find(|t| t.id == id)
    }
}

/// A chat request, streaming or blocking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub query: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            conversation_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }
}

/// Result of a blocking chat call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatResponse {
    pub message_id: String,
    pub conversation_id: String,
    pub content: String,
}

/// Text-to-speech request. Either `text` or `message_id` names what to speak.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextToAudioRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub user: String,
}

impl TextToAudioRequest {
    pub fn for_text(text: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            message_id: None,
            text: Some(text.into()),
            user: user.into(),
        }
    }
}
