//! # pulse-core
//!
//! Foundation types shared by the pulse stream client crates.
//!
//! - **Events**: [`events::EventRecord`], the closed [`events::ReservedEvent`]
//!   set emitted by the transport layer, and the open [`events::EventType`]
//!   channel for server-supplied names
//! - **Notices**: [`events::Notice`] payloads for the reserved events
//! - **Errors**: [`errors::TransportError`], [`errors::ParseError`],
//!   [`errors::LockError`], [`errors::ConnectionError`] via `thiserror`
//! - **Metrics**: counter names recorded by the stream and lock layers
//! - **Retry**: [`retry::BackoffConfig`] and backoff calculation
//! - **Text**: UTF-8 safe truncation for log previews
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other pulse crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod metrics;
pub mod retry;
pub mod text;

pub use errors::{ConnectionError, LockError, ParseError, TransportError};
pub use events::{EventRecord, EventType, Notice, ReservedEvent, ServerEvent};
pub use retry::BackoffConfig;
