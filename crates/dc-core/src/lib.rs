//! dc-core: Conversation state and the difychat command line.
//!
//! Exposed as a library for integration testing.

pub mod config;
pub mod conversation;
pub mod render;

pub use conversation::{Conversation, ConversationError, ConversationState};
