//! Transport abstraction and the HTTP implementation.
//!
//! A [`Transport`] opens one physical stream and hands back its body as a
//! byte stream. Reconnection, parsing, and dispatch live above it in
//! [`crate::connection`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use pulse_core::errors::TransportError;
use pulse_core::text::truncate_str;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tracing::debug;

/// Body of an open stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Header carrying the resume position on reconnect.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// Parameters for one open attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    /// Endpoint URL.
    pub url: String,
    /// Resume position, sent as `Last-Event-ID`.
    pub last_event_id: Option<String>,
}

/// Opens physical streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream. Resolves once the server has accepted it.
    async fn open(&self, request: &OpenRequest) -> Result<ByteStream, TransportError>;
}

/// `reqwest`-backed SSE transport.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport sharing an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &OpenRequest) -> Result<ByteStream, TransportError> {
        let mut builder = self
            .client
            .get(&request.url)
            .header(ACCEPT, EVENT_STREAM_MIME)
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = &request.last_event_id {
            builder = builder.header(LAST_EVENT_ID_HEADER, id);
        }

        let response = builder.send().await.map_err(|e| TransportError::Connect {
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate_str(&body, 200).to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.starts_with(EVENT_STREAM_MIME) {
            return Err(TransportError::ContentType {
                found: content_type,
            });
        }

        debug!(url = %request.url, status = status.as_u16(), "event stream accepted");
        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| TransportError::Read {
                    message: e.to_string(),
                })
            })
            .boxed())
    }
}
