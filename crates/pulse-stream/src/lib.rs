//! # pulse-stream
//!
//! Client side of a server-push event stream.
//!
//! - [`StreamFactory`]: builds endpoint URLs from settings and opens streams
//! - [`StreamConnection`]: the reconnecting state machine for one stream
//! - [`EventDispatcher`]: named-event fan-out to registered handlers
//! - [`Transport`] / [`HttpTransport`]: physical stream opening over `reqwest`
//! - [`FrameDecoder`]: incremental `text/event-stream` decoder
//!
//! ## Crate Position
//!
//! Depends on pulse-core, pulse-coord, and pulse-settings.

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod factory;
pub mod sse;
pub mod transport;

pub use connection::{ConnectionOptions, ConnectionState, Disconnector, StreamConnection};
pub use dispatcher::{EventDispatcher, Handler, SubscriptionId};
pub use factory::StreamFactory;
pub use sse::{DecodedFrame, FrameDecoder};
pub use transport::{ByteStream, HttpTransport, OpenRequest, Transport};
