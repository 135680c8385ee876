//! The seam between the conversation and whatever delivers response bytes.

use bytes::Bytes;
use dc_protocol::ChatRequest;
use futures::stream::BoxStream;
use thiserror::Error;

/// Raw response body, chunked however the transport likes.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Connection-level failure, distinct from in-band `error` events.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP error! status: {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{0}")]
    Io(String),
}

/// Opens streaming chat requests.
///
/// A connection failure (including a non-success status before any data) is
/// reported as an `Err` item; the stream ends after it. Exhaustion of the
/// stream is the end-of-response signal.
pub trait Transport: Send + Sync {
    fn open_stream(&self, request: &ChatRequest) -> ByteStream;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn open_stream(&self, request: &ChatRequest) -> ByteStream {
        (**self).open_stream(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display() {
        let err = TransportError::Status {
            status: 401,
            body: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error! status: 401: unauthorized");
    }

    #[test]
    fn io_error_display() {
        let err = TransportError::Io("connection refused".to_string());
        assert_eq!(err.to_string(), "connection refused");
    }
}
