//! Metric names shared across crates.
//!
//! Counters are recorded through the `metrics` facade. Without an installed
//! recorder they are no-ops.

/// Reconnect attempts scheduled (counter, labels: category).
pub const STREAM_RECONNECTS_TOTAL: &str = "stream_reconnects_total";
/// Frames that failed to parse (counter).
pub const STREAM_PARSE_ERRORS_TOTAL: &str = "stream_parse_errors_total";
/// Connections that reached `closed` (counter, labels: reason).
pub const STREAM_CLOSES_TOTAL: &str = "stream_closes_total";
/// Lock acquisitions rejected because the key was held (counter).
pub const LOCK_CONFLICTS_TOTAL: &str = "lock_conflicts_total";
/// Expired lock entries replaced by a new holder (counter).
pub const LOCK_STALE_REPLACEMENTS_TOTAL: &str = "lock_stale_replacements_total";
/// Callers that joined an in-flight deduplicated operation (counter).
pub const DEDUPE_JOINS_TOTAL: &str = "dedupe_joins_total";
