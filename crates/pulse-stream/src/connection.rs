//! # Stream connection
//!
//! One logical server-push channel, kept alive across transport drops.
//!
//! ```text
//! idle ──connect()──▶ connecting ──open──▶ open
//!                       ▲   │                │
//!              backoff  │   │ error/drop     │ error/drop
//!                       │   ▼                ▼
//!                     reconnecting ◀─────────┘
//!
//! any ──disconnect() / retries exhausted / fatal / terminal event──▶ closed
//! ```
//!
//! A single driver task runs the loop: open, read frames, dispatch, and on
//! failure either schedule the next attempt or close. The retry counter
//! resets whenever the connection reaches `open`. Parse failures become
//! `parse-error` events and never trigger a reconnect.
//!
//! [`StreamConnection::disconnect`] is idempotent. It holds the dispatch
//! gate while closing, so once it returns no handler will run again.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use parking_lot::Mutex;
use pulse_coord::{DebounceOptions, ThrottleOptions};
use pulse_core::errors::{ConnectionError, TransportError};
use pulse_core::events::{
    CloseReason, ClosedNotice, EventRecord, EventType, Notice, OpenedNotice, ParseErrorNotice,
    TransportErrorNotice,
};
use pulse_core::metrics::{STREAM_CLOSES_TOTAL, STREAM_PARSE_ERRORS_TOTAL, STREAM_RECONNECTS_TOTAL};
use pulse_core::retry::BackoffConfig;
use pulse_settings::StreamSettings;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::dispatcher::{EventDispatcher, SubscriptionId};
use crate::sse::{DecodedFrame, FrameDecoder};
use crate::transport::{OpenRequest, Transport};

/// Server event name that may signal a fatal error.
const ERROR_EVENT: &str = "error";

// ─────────────────────────────────────────────────────────────────────────────
// State and options
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`StreamConnection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Created, not yet connected.
    Idle,
    /// Opening the transport.
    Connecting,
    /// Receiving events.
    Open,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
    /// Terminal. Never left.
    Closed,
}

impl ConnectionState {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnection and timeout behavior of one connection.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Reconnect after transport loss.
    pub auto_reconnect: bool,
    /// Retry budget and backoff delays.
    pub backoff: BackoffConfig,
    /// Deadline for opening the transport.
    pub connect_timeout: Option<Duration>,
    /// Treat the stream as dropped after this long without bytes.
    pub idle_timeout: Option<Duration>,
    /// Server events after which the connection closes without reconnecting.
    pub close_on: Vec<String>,
}

impl ConnectionOptions {
    /// Options from settings.
    pub fn from_settings(settings: &StreamSettings) -> Self {
        let nonzero = |ms: u64| (ms > 0).then_some(Duration::from_millis(ms));
        Self {
            auto_reconnect: settings.auto_reconnect,
            backoff: BackoffConfig {
                max_retries: settings.retry_limit(),
                base_delay_ms: settings.backoff_base_ms,
                max_delay_ms: settings.backoff_max_ms,
                jitter_factor: settings.jitter_factor,
            },
            connect_timeout: nonzero(settings.connect_timeout_ms),
            idle_timeout: nonzero(settings.idle_timeout_ms),
            close_on: settings.close_on.clone(),
        }
    }

    /// Set automatic reconnection.
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the retry budget. `None` retries forever.
    #[must_use]
    pub fn max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.backoff.max_retries = max_retries;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_settings(&StreamSettings::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    retry_count: u32,
    last_event_id: Option<String>,
}

/// How one open attempt ended.
enum AttemptEnd {
    /// Disposed while the attempt was running.
    Cancelled,
    /// The transport failed or dropped.
    Failed(TransportError),
    /// The stream asked to be closed.
    Terminal(CloseReason, Option<String>),
}

struct ConnectionInner {
    url: String,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    state: watch::Sender<ConnectionState>,
    counters: Mutex<Counters>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` unless already closed. Returns whether the move happened.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut moved = false;
        let _ = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "state transition");
            *current = next;
            moved = true;
            true
        });
        moved
    }

    fn emit(&self, notice: &Notice) {
        self.dispatcher.dispatch(&EventRecord::notice(notice));
    }

    /// Close once. Later calls are no-ops.
    fn close(&self, reason: CloseReason, message: Option<String>) {
        let _gate = self.dispatcher.hold();
        if !self.transition(ConnectionState::Closed) {
            return;
        }
        self.cancel.cancel();
        counter!(STREAM_CLOSES_TOTAL, "reason" => reason.as_str()).increment(1);
        info!(url = %self.url, reason = reason.as_str(), "stream closed");
        self.emit(&Notice::Closed(ClosedNotice { reason, message }));
        self.dispatcher.shutdown();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut retry_hint_ms: Option<u64> = None;

        loop {
            let error = match self.attempt(&mut retry_hint_ms).await {
                AttemptEnd::Cancelled => return,
                AttemptEnd::Terminal(reason, message) => {
                    self.close(reason, message);
                    return;
                }
                AttemptEnd::Failed(error) => error,
            };

            let Some(delay) = self.handle_failure(&error, retry_hint_ms) else {
                return;
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            if !self.transition(ConnectionState::Connecting) {
                return;
            }
        }
    }

    /// Report `error` and decide what follows. Returns the backoff delay when
    /// a reconnect is scheduled; otherwise the connection is closed.
    fn handle_failure(&self, error: &TransportError, retry_hint_ms: Option<u64>) -> Option<Duration> {
        let backoff = &self.options.backoff;
        let close_reason = if !error.is_retryable() {
            Some(CloseReason::Fatal)
        } else if !self.options.auto_reconnect {
            Some(CloseReason::ReconnectDisabled)
        } else if !backoff.allows_retry(self.counters.lock().retry_count) {
            Some(CloseReason::RetriesExhausted)
        } else {
            None
        };

        let (retry_count, delay) = {
            let mut counters = self.counters.lock();
            if close_reason.is_none() {
                let delay = backoff.delay_for(counters.retry_count, retry_hint_ms);
                counters.retry_count += 1;
                (counters.retry_count, Some(delay))
            } else {
                (counters.retry_count, None)
            }
        };

        warn!(
            url = %self.url,
            category = error.category(),
            error = %error,
            retry_count,
            delay_ms = delay.map(|d| d.as_millis() as u64),
            "stream transport error"
        );
        self.emit(&Notice::TransportError(TransportErrorNotice {
            category: error.category().to_string(),
            message: error.to_string(),
            will_retry: delay.is_some(),
            retry_count,
            delay_ms: delay.map(|d| d.as_millis() as u64),
        }));

        match (close_reason, delay) {
            (None, Some(delay)) => {
                counter!(STREAM_RECONNECTS_TOTAL, "category" => error.category()).increment(1);
                self.transition(ConnectionState::Reconnecting).then_some(delay)
            }
            (reason, _) => {
                self.close(
                    reason.unwrap_or(CloseReason::RetriesExhausted),
                    Some(error.to_string()),
                );
                None
            }
        }
    }

    async fn attempt(&self, retry_hint_ms: &mut Option<u64>) -> AttemptEnd {
        let last_event_id = self.counters.lock().last_event_id.clone();
        let request = OpenRequest {
            url: self.url.clone(),
            last_event_id: last_event_id.clone(),
        };

        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return AttemptEnd::Cancelled,
            opened = within(self.options.connect_timeout, self.transport.open(&request)) => opened,
        };
        let mut body = match opened {
            Some(Ok(body)) => body,
            Some(Err(error)) => return AttemptEnd::Failed(error),
            None => {
                return AttemptEnd::Failed(TransportError::ConnectTimeout {
                    timeout_ms: millis(self.options.connect_timeout),
                });
            }
        };

        let attempts = std::mem::take(&mut self.counters.lock().retry_count);
        {
            let _gate = self.dispatcher.hold();
            if !self.transition(ConnectionState::Open) {
                return AttemptEnd::Cancelled;
            }
            info!(url = %self.url, attempts, "stream open");
            self.emit(&Notice::Opened(OpenedNotice {
                url: self.url.clone(),
                attempts,
            }));
        }

        let mut decoder = FrameDecoder::resuming(last_event_id);
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return AttemptEnd::Cancelled,
                next = within(self.options.idle_timeout, body.next()) => next,
            };
            let chunk = match next {
                Some(Some(Ok(chunk))) => chunk,
                Some(Some(Err(error))) => return AttemptEnd::Failed(error),
                Some(None) => return AttemptEnd::Failed(TransportError::Dropped),
                None => {
                    return AttemptEnd::Failed(TransportError::IdleTimeout {
                        timeout_ms: millis(self.options.idle_timeout),
                    });
                }
            };

            for frame in decoder.feed(&chunk) {
                if let Some(end) = self.handle_frame(frame) {
                    return end;
                }
            }
            if let Some(id) = decoder.last_event_id() {
                self.counters.lock().last_event_id = Some(id.to_string());
            }
            if let Some(hint) = decoder.retry_hint_ms() {
                *retry_hint_ms = Some(hint);
            }
        }
    }

    fn handle_frame(&self, frame: DecodedFrame) -> Option<AttemptEnd> {
        match frame {
            DecodedFrame::Event(record) => {
                if let Some(id) = record.last_event_id() {
                    self.counters.lock().last_event_id = Some(id.to_string());
                }
                self.dispatcher.dispatch(&record);

                let name = record.event_type().as_str();
                if name == ERROR_EVENT && record.payload().get("fatal").and_then(Value::as_bool) == Some(true) {
                    let message = record
                        .payload()
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("server reported a fatal error")
                        .to_string();
                    warn!(url = %self.url, %message, "server signaled fatal error");
                    return Some(AttemptEnd::Terminal(CloseReason::Fatal, Some(message)));
                }
                if self.options.close_on.iter().any(|n| n == name) {
                    debug!(url = %self.url, event = name, "terminal event received");
                    return Some(AttemptEnd::Terminal(CloseReason::StreamEnded, None));
                }
                None
            }
            DecodedFrame::Malformed { error, raw } => {
                counter!(STREAM_PARSE_ERRORS_TOTAL).increment(1);
                warn!(url = %self.url, error = %error, data_preview = %raw, "failed to parse stream frame");
                self.emit(&Notice::ParseError(ParseErrorNotice {
                    message: error.to_string(),
                    raw,
                }));
                None
            }
        }
    }
}

fn millis(duration: Option<Duration>) -> u64 {
    duration.map_or(0, |d| d.as_millis() as u64)
}

/// Await `fut`, giving up after `limit` if one is set. `None` means timed out.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// A server-push connection and its event dispatcher.
///
/// Dropping the handle disconnects.
pub struct StreamConnection {
    inner: Arc<ConnectionInner>,
}

impl StreamConnection {
    /// Create an idle connection to `url`.
    pub fn new(url: impl Into<String>, options: ConnectionOptions, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(ConnectionInner {
                url: url.into(),
                options,
                transport,
                dispatcher: EventDispatcher::new(),
                state,
                counters: Mutex::new(Counters::default()),
                cancel: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Start the driver. A no-op if already started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let mut driver = self.inner.driver.lock();
        match self.inner.state() {
            ConnectionState::Closed => return Err(ConnectionError::Disposed),
            ConnectionState::Idle if driver.is_none() => {}
            _ => return Ok(()),
        }

        let _ = self.inner.transition(ConnectionState::Connecting);
        let span = info_span!("stream", url = %self.inner.url);
        let inner = Arc::clone(&self.inner);
        *driver = Some(tokio::spawn(inner.run().instrument(span)));
        Ok(())
    }

    /// Close the connection. Idempotent.
    ///
    /// Cancels any pending reconnect, emits `connection-closed` once, and
    /// removes every handler before returning.
    pub fn disconnect(&self) {
        self.inner.close(CloseReason::Disposed, None);
    }

    /// A handle that can disconnect without owning the connection, for use
    /// inside handlers.
    pub fn disconnector(&self) -> Disconnector {
        Disconnector {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Reconnect attempts since the connection was last open.
    pub fn retry_count(&self) -> u32 {
        self.inner.counters.lock().retry_count
    }

    /// The most recent event id received, resent on reconnect.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.counters.lock().last_event_id.clone()
    }

    /// The connection's options.
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// The dispatcher handlers register on.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Register `handler` for `event`. See [`EventDispatcher::on`].
    pub fn on(
        &self,
        event: impl Into<EventType>,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.dispatcher.on(event, handler)
    }

    /// Register `handler` for every event. See [`EventDispatcher::on_any`].
    pub fn on_any(&self, handler: impl Fn(&EventRecord) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.dispatcher.on_any(handler)
    }

    /// Register a throttled handler. See [`EventDispatcher::on_throttled`].
    pub fn on_throttled(
        &self,
        event: impl Into<EventType>,
        options: ThrottleOptions,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.dispatcher.on_throttled(event, options, handler)
    }

    /// Register a debounced handler. See [`EventDispatcher::on_debounced`].
    pub fn on_debounced(
        &self,
        event: impl Into<EventType>,
        options: DebounceOptions,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.dispatcher.on_debounced(event, options, handler)
    }

    /// Remove a registration.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.off(id)
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

/// Weak disconnect handle. See [`StreamConnection::disconnector`].
#[derive(Clone, Debug)]
pub struct Disconnector {
    inner: Weak<ConnectionInner>,
}

impl Disconnector {
    /// Close the connection if it still exists. Idempotent.
    pub fn disconnect(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.close(CloseReason::Disposed, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_from_settings() {
        let settings = StreamSettings {
            unbounded_retries: true,
            idle_timeout_ms: 0,
            ..StreamSettings::default()
        };
        let options = ConnectionOptions::from_settings(&settings);
        assert!(options.auto_reconnect);
        assert_eq!(options.backoff.max_retries, None);
        assert_eq!(options.idle_timeout, None);
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(options.close_on, vec!["stream-end".to_string()]);
    }

    #[test]
    fn option_builders() {
        let options = ConnectionOptions::default().auto_reconnect(false).max_retries(Some(2));
        assert!(!options.auto_reconnect);
        assert_eq!(options.backoff.max_retries, Some(2));
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(serde_json::to_value(ConnectionState::Open).unwrap(), "open");
    }

    #[tokio::test]
    async fn within_without_limit_waits() {
        assert_eq!(within(None, async { 5 }).await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn within_times_out() {
        let slow = tokio::time::sleep(Duration::from_secs(10));
        assert_eq!(within(Some(Duration::from_millis(5)), slow).await, None);
    }
}
