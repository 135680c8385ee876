//! dc-backend: transports and stream decoding for difychat.
//!
//! Turns a chat service's chunked event stream into typed [`StreamEvent`]s.
//! The [`Transport`] trait is the seam the conversation is built against;
//! [`DifyClient`] implements it over HTTP and [`MockTransport`] replays
//! scripted responses for tests.
//!
//! [`StreamEvent`]: dc_protocol::StreamEvent

pub mod dify;
pub mod framer;
pub mod mock;
pub mod transport;

pub use dify::{ClientError, DifyClient};
pub use framer::{decode_line, decode_payload, parse_event_stream, EventStream, StreamFramer};
pub use mock::{MockConfig, MockResponse, MockTransport};
pub use transport::{ByteStream, Transport, TransportError};
