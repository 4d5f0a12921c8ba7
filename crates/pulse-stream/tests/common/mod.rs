//! Scripted transport and event recording for connection tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use pulse_core::errors::TransportError;
use pulse_core::events::{EventRecord, Notice};
use pulse_core::retry::BackoffConfig;
use pulse_stream::{ByteStream, ConnectionOptions, OpenRequest, StreamConnection, Transport};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const URL: &str = "http://test.local/streams/job-1";

/// One scripted response to `Transport::open`.
pub enum Attempt {
    Fail(TransportError),
    Open(ByteStream),
}

/// Test-side end of an open stream.
pub struct Feed {
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl Feed {
    pub fn raw(&self, text: &str) {
        let _ = self.tx.send(Ok(Bytes::from(text.to_string())));
    }

    pub fn event(&self, name: &str, data: &str) {
        self.raw(&format!("event: {name}\ndata: {data}\n\n"));
    }

    pub fn fail(&self, error: TransportError) {
        let _ = self.tx.send(Err(error));
    }

    /// Close the stream from the server side.
    pub fn drop_stream(self) {}
}

/// An open stream attempt and its feed.
pub fn stream() -> (Feed, Attempt) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Feed { tx }, Attempt::Open(UnboundedReceiverStream::new(rx).boxed()))
}

/// Returns scripted attempts in order; pends forever once the script runs out.
#[derive(Default)]
pub struct ScriptedTransport {
    attempts: Mutex<VecDeque<Attempt>>,
    requests: Mutex<Vec<OpenRequest>>,
}

impl ScriptedTransport {
    pub fn new(attempts: Vec<Attempt>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(attempts.into()),
            requests: Mutex::default(),
        })
    }

    pub fn push(&self, attempt: Attempt) {
        self.attempts.lock().push_back(attempt);
    }

    pub fn requests(&self) -> Vec<OpenRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, request: &OpenRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().push(request.clone());
        let next = self.attempts.lock().pop_front();
        match next {
            Some(Attempt::Fail(error)) => Err(error),
            Some(Attempt::Open(body)) => Ok(body),
            None => futures::future::pending().await,
        }
    }
}

/// Options with deterministic backoff: 100ms, 200ms, 400ms, ...
pub fn options() -> ConnectionOptions {
    ConnectionOptions {
        auto_reconnect: true,
        backoff: BackoffConfig {
            max_retries: Some(3),
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
        },
        connect_timeout: None,
        idle_timeout: None,
        close_on: vec!["stream-end".into()],
    }
}

pub fn connection(transport: &Arc<ScriptedTransport>, options: ConnectionOptions) -> StreamConnection {
    StreamConnection::new(URL, options, Arc::clone(transport) as Arc<dyn Transport>)
}

/// Every record delivered to the connection, with the state at delivery.
#[derive(Clone, Default)]
pub struct Recorder {
    records: Arc<Mutex<Vec<(EventRecord, String)>>>,
}

impl Recorder {
    pub fn attach(connection: &StreamConnection) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.records);
        let state = connection.subscribe_state();
        let _ = connection.on_any(move |record| {
            sink.lock().push((record.clone(), state.borrow().to_string()));
        });
        recorder
    }

    pub fn names(&self) -> Vec<String> {
        self.records.lock().iter().map(|(r, _)| r.event_type().to_string()).collect()
    }

    pub fn states(&self) -> Vec<String> {
        self.records.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.records.lock().iter().filter_map(|(r, _)| r.as_notice()).collect()
    }

    pub fn payloads(&self, name: &str) -> Vec<serde_json::Value> {
        self.records
            .lock()
            .iter()
            .filter(|(r, _)| r.event_type().as_str() == name)
            .map(|(r, _)| r.payload().clone())
            .collect()
    }
}

/// Let the driver run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
