//! Event vocabulary shared by connections, dispatchers, and subscribers.
//!
//! Two kinds of event names flow through a stream:
//!
//! - **Reserved** ([`ReservedEvent`]): a closed set emitted by the connection
//!   itself (`connection-opened`, `connection-closed`, `transport-error`,
//!   `parse-error`). Their payloads are typed [`Notice`]s.
//! - **Server** ([`EventType::Server`]): any name carried in a frame's
//!   discriminator. Payloads are opaque JSON. [`ServerEvent`] lists the
//!   names the backend is known to send.
//!
//! Server frames can never produce a reserved [`EventType`], even if the
//! server sends a colliding name.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Event names
// ─────────────────────────────────────────────────────────────────────────────

/// Event names emitted by the connection regardless of server payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservedEvent {
    /// The transport reached the open state.
    ConnectionOpened,
    /// The connection reached the terminal closed state.
    ConnectionClosed,
    /// The transport failed or dropped.
    TransportError,
    /// A frame could not be parsed.
    ParseError,
}

impl ReservedEvent {
    /// All reserved events.
    pub const ALL: [Self; 4] = [
        Self::ConnectionOpened,
        Self::ConnectionClosed,
        Self::TransportError,
        Self::ParseError,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection-opened",
            Self::ConnectionClosed => "connection-closed",
            Self::TransportError => "transport-error",
            Self::ParseError => "parse-error",
        }
    }

    /// Look up a reserved event by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

/// Business event names the backend is known to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    /// Server acknowledged the subscription.
    Connected,
    /// Incremental content chunk.
    Token,
    /// A processing stage started or finished.
    StageUpdate,
    /// Progress of a long-running job.
    Progress,
    /// The job finished.
    Done,
    /// The server will send nothing further on this stream.
    StreamEnd,
}

impl ServerEvent {
    /// All known server events.
    pub const ALL: [Self; 6] = [
        Self::Connected,
        Self::Token,
        Self::StageUpdate,
        Self::Progress,
        Self::Done,
        Self::StreamEnd,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Token => "token",
            Self::StageUpdate => "stage-update",
            Self::Progress => "progress",
            Self::Done => "done",
            Self::StreamEnd => "stream-end",
        }
    }

    /// Look up a known server event by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == name)
    }
}

/// The name a handler subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Connection-level event.
    Reserved(ReservedEvent),
    /// Server-supplied discriminator.
    Server(String),
}

impl EventType {
    /// A server event type, even if the name collides with a reserved one.
    pub fn server(name: impl Into<String>) -> Self {
        Self::Server(name.into())
    }

    /// Wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Reserved(r) => r.as_str(),
            Self::Server(name) => name,
        }
    }

    /// Whether this is a connection-level event.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved(_))
    }

    /// The known server event this name refers to, if any.
    pub fn server_event(&self) -> Option<ServerEvent> {
        match self {
            Self::Server(name) => ServerEvent::from_name(name),
            Self::Reserved(_) => None,
        }
    }
}

impl From<ReservedEvent> for EventType {
    fn from(value: ReservedEvent) -> Self {
        Self::Reserved(value)
    }
}

impl From<ServerEvent> for EventType {
    fn from(value: ServerEvent) -> Self {
        Self::Server(value.as_str().to_string())
    }
}

/// Subscriber-side lookup: reserved names map to [`EventType::Reserved`].
impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        ReservedEvent::from_name(value).map_or_else(|| Self::Server(value.to_string()), Self::Reserved)
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match ReservedEvent::from_name(&value) {
            Some(r) => Self::Reserved(r),
            None => Self::Server(value),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notices (reserved event payloads)
// ─────────────────────────────────────────────────────────────────────────────

/// Why a connection reached `closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The owner called `disconnect`.
    Disposed,
    /// The reconnect budget ran out.
    RetriesExhausted,
    /// The transport failed and automatic reconnection is off.
    ReconnectDisabled,
    /// The server or transport reported a non-retryable failure.
    Fatal,
    /// The server sent a terminal event.
    StreamEnded,
}

impl CloseReason {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disposed => "disposed",
            Self::RetriesExhausted => "retries-exhausted",
            Self::ReconnectDisabled => "reconnect-disabled",
            Self::Fatal => "fatal",
            Self::StreamEnded => "stream-ended",
        }
    }
}

/// Payload of `connection-opened`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedNotice {
    /// Endpoint URL.
    pub url: String,
    /// Consecutive failed attempts before this open (0 on first connect).
    pub attempts: u32,
}

/// Payload of `connection-closed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedNotice {
    /// Why the connection closed.
    pub reason: CloseReason,
    /// Last error message, if the close followed a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of `transport-error`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportErrorNotice {
    /// Error category (see `TransportError::category`).
    pub category: String,
    /// Human-readable message.
    pub message: String,
    /// Whether a reconnect attempt follows.
    pub will_retry: bool,
    /// Reconnect attempts made so far, including the one this notice schedules.
    pub retry_count: u32,
    /// Delay before the next attempt, when one follows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

/// Payload of `parse-error`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseErrorNotice {
    /// Parser error description.
    pub message: String,
    /// Truncated raw frame data.
    pub raw: String,
}

/// Typed payload of a reserved event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// `connection-opened`
    Opened(OpenedNotice),
    /// `connection-closed`
    Closed(ClosedNotice),
    /// `transport-error`
    TransportError(TransportErrorNotice),
    /// `parse-error`
    ParseError(ParseErrorNotice),
}

impl Notice {
    /// The reserved event this notice is delivered as.
    pub fn reserved(&self) -> ReservedEvent {
        match self {
            Self::Opened(_) => ReservedEvent::ConnectionOpened,
            Self::Closed(_) => ReservedEvent::ConnectionClosed,
            Self::TransportError(_) => ReservedEvent::TransportError,
            Self::ParseError(_) => ReservedEvent::ParseError,
        }
    }

    fn to_payload(&self) -> Value {
        let value = match self {
            Self::Opened(n) => serde_json::to_value(n),
            Self::Closed(n) => serde_json::to_value(n),
            Self::TransportError(n) => serde_json::to_value(n),
            Self::ParseError(n) => serde_json::to_value(n),
        };
        // Plain structs with string keys always serialize.
        value.unwrap_or(Value::Null)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventRecord
// ─────────────────────────────────────────────────────────────────────────────

/// One delivered event. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(rename = "type")]
    event_type: EventType,
    payload: Value,
    received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_event_id: Option<String>,
}

impl EventRecord {
    /// A record for a server frame.
    pub fn server(name: impl Into<String>, payload: Value, last_event_id: Option<String>) -> Self {
        Self {
            event_type: EventType::server(name),
            payload,
            received_at: Utc::now(),
            last_event_id,
        }
    }

    /// A record for a reserved event.
    pub fn notice(notice: &Notice) -> Self {
        Self {
            event_type: EventType::Reserved(notice.reserved()),
            payload: notice.to_payload(),
            received_at: Utc::now(),
            last_event_id: None,
        }
    }

    /// Event name.
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Event payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// When the record was constructed.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// The stream's last event id at the time this frame arrived.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Decode the typed notice of a reserved record.
    pub fn as_notice(&self) -> Option<Notice> {
        let EventType::Reserved(reserved) = self.event_type else {
            return None;
        };
        let payload = self.payload.clone();
        match reserved {
            ReservedEvent::ConnectionOpened => serde_json::from_value(payload).ok().map(Notice::Opened),
            ReservedEvent::ConnectionClosed => serde_json::from_value(payload).ok().map(Notice::Closed),
            ReservedEvent::TransportError => {
                serde_json::from_value(payload).ok().map(Notice::TransportError)
            }
            ReservedEvent::ParseError => serde_json::from_value(payload).ok().map(Notice::ParseError),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
