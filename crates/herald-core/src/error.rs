//! Error types for event construction and wire encoding.
//!
//! Covers invalid event attributes, failures while writing an event onto an
//! HTTP message, and failures while reading one back. Decode failures are
//! kept distinct so the dispatch pipeline can treat an undecodable reply as
//! "no reply" instead of an error.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for event and binding operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// An event attribute or extension failed validation.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// What was wrong with the event
        message: String,
    },

    /// The event could not be written onto an HTTP message.
    #[error("could not encode event: {message}")]
    Encode {
        /// Encoding failure description
        message: String,
    },

    /// An HTTP message claimed to carry an event but did not parse.
    #[error("could not decode event: {message}")]
    Decode {
        /// Decoding failure description
        message: String,
    },

    /// An addressable was missing or carried an unusable URL.
    #[error("invalid addressable: {message}")]
    InvalidAddressable {
        /// Addressable problem description
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid event error.
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::InvalidEvent { message: message.into() }
    }

    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode { message: message.into() }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Creates an invalid addressable error.
    pub fn invalid_addressable(message: impl Into<String>) -> Self {
        Self::InvalidAddressable { message: message.into() }
    }

    /// Returns true when the error came from reading an inbound message.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
