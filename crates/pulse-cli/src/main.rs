//! # pulse-tail
//!
//! Follow one server-sent event stream from the terminal. Token text goes
//! to stdout; progress, stage changes, and connection notices go to stderr.
//! With `--json`, every event is written to stdout as one JSON line.
//! With `--metrics`, connection counters are printed to stderr on exit.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use pulse_coord::{CoordinationLock, DebounceOptions, LockOptions, ThrottleOptions};
use pulse_core::errors::ConnectionError;
use pulse_core::events::{CloseReason, EventRecord, Notice, ReservedEvent, ServerEvent};
use pulse_settings::loader::parse_retry_limit;
use pulse_settings::{PulseSettings, RateSettings, load_settings, load_settings_from_path};
use pulse_stream::{StreamConnection, StreamFactory};
use serde_json::Value;
use tracing::{info, warn};

/// Follow a server-sent event stream.
#[derive(Parser, Debug)]
#[command(name = "pulse-tail", about = "Follow a server-sent event stream")]
struct Cli {
    /// Resource to follow (e.g. a job id).
    resource: String,

    /// Sub-channel of the resource.
    #[arg(long)]
    channel: Option<String>,

    /// Base URL of the streaming API (overrides settings).
    #[arg(long)]
    base_url: Option<String>,

    /// Close on the first transport failure instead of reconnecting.
    #[arg(long)]
    no_reconnect: bool,

    /// Reconnect budget: a count, or `unbounded`.
    #[arg(long)]
    max_retries: Option<String>,

    /// Settings file (defaults to `~/.pulse/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Write every event to stdout as a JSON line.
    #[arg(long)]
    json: bool,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Print counters in Prometheus text format to stderr on exit.
    #[arg(long)]
    metrics: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<PulseSettings> {
        let mut settings = match &self.settings {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => load_settings().unwrap_or_default(),
        };
        self.apply(&mut settings)?;
        Ok(settings)
    }

    /// Apply command-line overrides on top of loaded settings.
    fn apply(&self, settings: &mut PulseSettings) -> Result<()> {
        if let Some(url) = &self.base_url {
            settings.stream.base_url.clone_from(url);
        }
        if self.no_reconnect {
            settings.stream.auto_reconnect = false;
        }
        if let Some(raw) = &self.max_retries {
            match parse_retry_limit(raw) {
                Some(Some(n)) => {
                    settings.stream.max_retries = n;
                    settings.stream.unbounded_retries = false;
                }
                Some(None) => settings.stream.unbounded_retries = true,
                None => bail!("invalid --max-retries value: {raw}"),
            }
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
        Ok(())
    }
}

/// One stderr line for a connection notice.
fn describe(notice: &Notice) -> String {
    match notice {
        Notice::Opened(n) if n.attempts > 0 => {
            format!("reconnected to {} after {} attempt(s)", n.url, n.attempts)
        }
        Notice::Opened(n) => format!("connected to {}", n.url),
        Notice::TransportError(n) => match n.delay_ms {
            Some(delay) if n.will_retry => {
                format!("{} (retry {} in {delay}ms)", n.message, n.retry_count)
            }
            _ => format!("{} (giving up)", n.message),
        },
        Notice::ParseError(n) => format!("skipped malformed frame: {}", n.message),
        Notice::Closed(n) => match &n.message {
            Some(message) => format!("stream closed ({}): {message}", n.reason.as_str()),
            None => format!("stream closed ({})", n.reason.as_str()),
        },
    }
}

/// Text of a token payload, or the raw payload if it has none.
fn token_text(payload: &Value) -> String {
    match payload.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => payload.to_string(),
    }
}

/// Error for close reasons that mean the stream did not finish normally.
fn close_failure(reason: CloseReason) -> Option<String> {
    match reason {
        CloseReason::Disposed | CloseReason::StreamEnded => None,
        other => Some(format!("stream closed: {}", other.as_str())),
    }
}

fn attach_handlers(
    connection: &StreamConnection,
    rate: &RateSettings,
    json: bool,
    outcome: &Arc<Mutex<Option<CloseReason>>>,
) {
    let outcome = Arc::clone(outcome);
    let _ = connection.on(ReservedEvent::ConnectionClosed, move |record| {
        if let Some(Notice::Closed(closed)) = record.as_notice() {
            *outcome.lock() = Some(closed.reason);
        }
    });

    if json {
        let _ = connection.on_any(|record: &EventRecord| match serde_json::to_string(record) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to encode event"),
        });
        return;
    }

    let _ = connection.on_any(|record: &EventRecord| {
        if let Some(notice) = record.as_notice() {
            eprintln!("[pulse] {}", describe(&notice));
        }
    });
    let _ = connection.on(ServerEvent::Token, |record| {
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{}", token_text(record.payload()));
        let _ = stdout.flush();
    });
    let _ = connection.on(ServerEvent::Done, |_| println!());
    let _ = connection.on_throttled(ServerEvent::Progress, ThrottleOptions::from_settings(rate), |record| {
        eprintln!("[progress] {}", record.payload());
    });
    let _ = connection.on_debounced(
        ServerEvent::StageUpdate,
        DebounceOptions::from_settings(rate),
        |record| {
            let stage = record.payload().get("stage").and_then(Value::as_str).unwrap_or("?");
            eprintln!("[stage] {stage}");
        },
    );
}

/// Install the global Prometheus recorder.
fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    if settings.logging.json {
        pulse_logging::init_json_subscriber(&settings.logging.level);
    } else {
        pulse_logging::init_subscriber(&settings.logging.level);
    }
    let metrics_handle = if args.metrics {
        Some(install_recorder()?)
    } else {
        None
    };

    let factory = StreamFactory::new(settings.stream.clone());
    let lock = CoordinationLock::from_settings(&settings.lock);
    let lock_options = LockOptions::new().on_conflict(|key| warn!(key, "connect already in progress"));
    let outcome = Arc::new(Mutex::new(None));

    let key = format!("connect:{}", args.resource);
    let connection = lock
        .with_lock(&key, &lock_options, || async {
            let connection = factory.prepare_stream(
                &args.resource,
                args.channel.as_deref(),
                factory.default_options(),
            )?;
            attach_handlers(&connection, &settings.rate, args.json, &outcome);
            connection.connect()?;
            Ok::<_, ConnectionError>(connection)
        })
        .await
        .context("Failed to open stream")?;
    info!(url = connection.url(), "following stream");

    tokio::select! {
        () = connection.closed() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("interrupted, disconnecting");
            connection.disconnect();
        }
    }

    if let Some(handle) = &metrics_handle {
        eprint!("{}", handle.render());
    }

    let reason = *outcome.lock();
    match reason.and_then(close_failure) {
        Some(message) => bail!(message),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::events::{ClosedNotice, OpenedNotice, TransportErrorNotice};
    use serde_json::json;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("pulse-tail").chain(args.iter().copied()))
    }

    #[test]
    fn overrides_apply_to_settings() {
        let mut settings = PulseSettings::default();
        cli(&["job-1", "--base-url", "http://h/api", "--no-reconnect", "--max-retries", "3"])
            .apply(&mut settings)
            .unwrap();
        assert_eq!(settings.stream.base_url, "http://h/api");
        assert!(!settings.stream.auto_reconnect);
        assert_eq!(settings.stream.max_retries, 3);
        assert!(!settings.stream.unbounded_retries);
    }

    #[test]
    fn metrics_flag_is_parsed() {
        assert!(cli(&["job-1", "--metrics"]).metrics);
        assert!(!cli(&["job-1"]).metrics);
    }

    #[test]
    fn unbounded_retries_flag() {
        let mut settings = PulseSettings::default();
        cli(&["job-1", "--max-retries", "unbounded"]).apply(&mut settings).unwrap();
        assert!(settings.stream.unbounded_retries);
        assert_eq!(settings.stream.retry_limit(), None);
    }

    #[test]
    fn invalid_retry_limit_rejected() {
        let mut settings = PulseSettings::default();
        assert!(cli(&["job-1", "--max-retries", "lots"]).apply(&mut settings).is_err());
    }

    #[test]
    fn settings_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"stream": {"baseUrl": "http://from-file/api"}}"#).unwrap();
        let settings = cli(&["job-1", "--settings", path.to_str().unwrap(), "--json"])
            .load_settings()
            .unwrap();
        assert_eq!(settings.stream.base_url, "http://from-file/api");
        assert!(settings.logging.json);
    }

    #[test]
    fn notices_are_described() {
        let opened = Notice::Opened(OpenedNotice {
            url: "http://h/streams/job".into(),
            attempts: 2,
        });
        assert_eq!(describe(&opened), "reconnected to http://h/streams/job after 2 attempt(s)");

        let retry = Notice::TransportError(TransportErrorNotice {
            category: "dropped".into(),
            message: "stream closed by server".into(),
            will_retry: true,
            retry_count: 1,
            delay_ms: Some(1000),
        });
        assert_eq!(describe(&retry), "stream closed by server (retry 1 in 1000ms)");

        let closed = Notice::Closed(ClosedNotice {
            reason: CloseReason::RetriesExhausted,
            message: Some("connect failed: refused".into()),
        });
        assert_eq!(
            describe(&closed),
            "stream closed (retries-exhausted): connect failed: refused"
        );
    }

    #[test]
    fn token_text_falls_back_to_payload() {
        assert_eq!(token_text(&json!({"text": "hi"})), "hi");
        assert_eq!(token_text(&json!({"n": 1})), r#"{"n":1}"#);
    }

    #[test]
    fn abnormal_closes_fail() {
        assert_eq!(close_failure(CloseReason::StreamEnded), None);
        assert_eq!(close_failure(CloseReason::Disposed), None);
        assert_eq!(
            close_failure(CloseReason::Fatal).as_deref(),
            Some("stream closed: fatal")
        );
    }
}
