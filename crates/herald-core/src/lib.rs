//! Core event model and wire codec.
//!
//! Provides the immutable [`Event`] type, destination identities
//! ([`Addressable`]), and the CloudEvents HTTP binding used to put events
//! on the wire and read replies back. The dispatch crate builds on these
//! types; nothing here performs I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod binding;
pub mod error;
pub mod event;
pub mod models;

pub use binding::{
    read_encoding, read_event, write_message, Encoding, HttpMessage, MessageEncoding,
};
pub use error::{CoreError, Result};
pub use event::{Event, EventBuilder, ExtensionValue, SPEC_VERSION};
pub use models::Addressable;
