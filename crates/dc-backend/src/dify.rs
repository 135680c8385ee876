//! Dify chat API client: streaming transport, blocking call and text-to-audio.

use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use dc_protocol::{ChatRequest, ChatResponse, TextToAudioRequest};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::transport::{ByteStream, Transport, TransportError};

const CHAT_PATH: &str = "chat-messages";
const AUDIO_PATH: &str = "text-to-audio";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },
    #[error("invalid client configuration: {0}")]
    Config(String),
}

/// Client for a Dify application's chat endpoints.
#[derive(Clone)]
pub struct DifyClient {
    base_url: String,
    token: String,
    http: Client,
}

/// Build an HTTP client. Only the connect phase is bounded; a streamed
/// answer may legitimately take minutes.
fn build_http_client(connect_timeout: Duration) -> Result<Client, ClientError> {
    Ok(Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(2)
        .build()?)
}

impl DifyClient {
    /// Create a client for `base_url` (e.g. `https://api.dify.ai/v1`).
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_connect_timeout(base_url, token, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(
        base_url: impl Into<String>,
        token: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ClientError::Config("base URL is empty".to_string()));
        }

        Ok(Self {
            base_url,
            token: token.into(),
            http: build_http_client(connect_timeout)?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Send a request in blocking mode and return the full answer.
    pub async fn send_blocking(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        let body = ChatMessagesBody::new(request, ResponseMode::Blocking);

        let response = self
            .http
            .post(self.endpoint(CHAT_PATH))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let response = check_api_status(response).await?;

        let resp: BlockingResponse = response.json().await?;
        Ok(ChatResponse {
            message_id: resp.id,
            conversation_id: resp.conversation_id,
            content: resp.answer,
        })
    }

    /// Synthesize speech for a message or a piece of text. Returns the raw
    /// audio body.
    pub async fn text_to_audio(&self, request: &TextToAudioRequest) -> Result<Bytes, ClientError> {
        let response = self
            .http
            .post(self.endpoint(AUDIO_PATH))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        let response = check_api_status(response).await?;

        Ok(response.bytes().await?)
    }
}

impl Transport for DifyClient {
    fn open_stream(&self, request: &ChatRequest) -> ByteStream {
        let http = self.http.clone();
        let url = self.endpoint(CHAT_PATH);
        let token = self.token.clone();
        let body = ChatMessagesBody::new(request, ResponseMode::Streaming);

        Box::pin(stream! {
            match send_stream_request(&http, &url, &token, &body).await {
                Ok(response) => {
                    info!("stream opened: {url}");
                    let mut bytes = response.bytes_stream();
                    while let Some(chunk) = bytes.next().await {
                        match chunk {
                            Ok(chunk) => yield Ok(chunk),
                            Err(e) => {
                                warn!("stream read failed: {e}");
                                yield Err(TransportError::Http(e));
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("stream request failed: {e}");
                    yield Err(e);
                }
            }
        })
    }
}

async fn send_stream_request(
    http: &Client,
    url: &str,
    token: &str,
    body: &ChatMessagesBody,
) -> Result<Response, TransportError> {
    let response = http
        .post(url)
        .bearer_auth(token)
        .header("accept", "text/event-stream")
        .json(body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status { status, body });
    }

    Ok(response)
}

/// Pass a successful response through; turn anything else into
/// [`ClientError::Api`], using the service's error body when it has one.
async fn check_api_status(response: Response) -> Result<Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();

    Err(ClientError::Api {
        status,
        message: body
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "request failed".to_string()),
        code: body.code,
    })
}

// API request/response types

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResponseMode {
    Streaming,
    Blocking,
}

#[derive(Debug, Serialize)]
struct ChatMessagesBody {
    inputs: Map<String, Value>,
    query: String,
    user: String,
    response_mode: ResponseMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

impl ChatMessagesBody {
    fn new(request: &ChatRequest, response_mode: ResponseMode) -> Self {
        Self {
            inputs: Map::new(),
            query: request.query.clone(),
            user: request.user.clone(),
            response_mode,
            conversation_id: request.conversation_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockingResponse {
    id: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    answer: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}
