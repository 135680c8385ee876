//! dc-protocol: Shared types for difychat.
//!
//! Defines the stream events decoded from the chat service and the
//! conversation records the aggregator builds from them.

pub mod chat;
pub mod message;

pub use chat::{
    ChatRequest, ChatResponse, FileRef, Message, Role, TextToAudioRequest, Thought,
};
pub use message::{FileEvent, StreamEvent, ThoughtEvent};
