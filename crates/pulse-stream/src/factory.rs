//! Stream construction from settings.
//!
//! The factory turns a resource id (and optional sub-channel) into an
//! endpoint URL using the configured templates, then builds a
//! [`StreamConnection`] bound to it.

use std::sync::Arc;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use pulse_core::errors::ConnectionError;
use pulse_settings::StreamSettings;
use tracing::debug;

use crate::connection::{ConnectionOptions, StreamConnection};
use crate::transport::{HttpTransport, Transport};

/// Characters escaped inside a single path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Opens streams against one configured API.
#[derive(Clone)]
pub struct StreamFactory {
    settings: StreamSettings,
    transport: Arc<dyn Transport>,
}

impl StreamFactory {
    /// Factory using HTTP.
    pub fn new(settings: StreamSettings) -> Self {
        Self::with_transport(settings, Arc::new(HttpTransport::new()))
    }

    /// Factory using a custom transport.
    pub fn with_transport(settings: StreamSettings, transport: Arc<dyn Transport>) -> Self {
        Self { settings, transport }
    }

    /// Connection options derived from the factory's settings.
    pub fn default_options(&self) -> ConnectionOptions {
        ConnectionOptions::from_settings(&self.settings)
    }

    /// Endpoint URL for `resource` and optional `channel`.
    pub fn endpoint(&self, resource: &str, channel: Option<&str>) -> Result<String, ConnectionError> {
        if resource.trim().is_empty() {
            return Err(ConnectionError::InvalidEndpoint("resource id is empty".into()));
        }
        let resource = utf8_percent_encode(resource, SEGMENT).to_string();
        let path = match channel {
            Some(channel) if channel.trim().is_empty() => {
                return Err(ConnectionError::InvalidEndpoint("channel is empty".into()));
            }
            Some(channel) => self
                .settings
                .channel_template
                .replace("{resource}", &resource)
                .replace("{channel}", &utf8_percent_encode(channel, SEGMENT).to_string()),
            None => self.settings.path_template.replace("{resource}", &resource),
        };

        let base = self.settings.base_url.trim_end_matches('/');
        let url = if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };

        reqwest::Url::parse(&url)
            .map(|_| url)
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))
    }

    /// Build an idle connection. Register handlers, then call
    /// [`StreamConnection::connect`].
    pub fn prepare_stream(
        &self,
        resource: &str,
        channel: Option<&str>,
        options: ConnectionOptions,
    ) -> Result<StreamConnection, ConnectionError> {
        let url = self.endpoint(resource, channel)?;
        debug!(%url, "stream prepared");
        Ok(StreamConnection::new(url, options, Arc::clone(&self.transport)))
    }

    /// Build a connection and start connecting immediately.
    ///
    /// Handlers registered after this returns only see events from the
    /// moment they register. Must be called from within a Tokio runtime.
    pub fn open_stream(
        &self,
        resource: &str,
        channel: Option<&str>,
        options: ConnectionOptions,
    ) -> Result<StreamConnection, ConnectionError> {
        let connection = self.prepare_stream(resource, channel, options)?;
        connection.connect()?;
        Ok(connection)
    }
}

impl std::fmt::Debug for StreamFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFactory")
            .field("base_url", &self.settings.base_url)
            .finish_non_exhaustive()
    }
}
