//! Error types for event dispatch.
//!
//! Covers configuration problems detected before any I/O, failures of a
//! single HTTP exchange (transport, timeout, non-2xx status), and the
//! combined failures of the dispatch pipeline where a dead-letter or reply
//! hop failed on top of the primary one. Errors carry the target URL and
//! the underlying cause so the caller can log one line that names every
//! hop involved.

use std::fmt;

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error types for dispatch operations.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Invalid configuration: bad CA bundle, invalid header, unusable client
    /// settings.
    #[error("invalid dispatch configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// The destination addressable carried no URL.
    #[error("can not dispatch message to nil destination URL")]
    MissingDestination,

    /// The event could not be written onto a request.
    #[error("could not encode event for {target}: {message}")]
    Encoding {
        /// URL the request was meant for
        target: String,
        /// Encoding failure description
        message: String,
    },

    /// Connection-level failure: refused, reset, DNS, TLS.
    #[error("request to {target} failed: {message}")]
    Transport {
        /// URL the request was sent to
        target: String,
        /// Transport error message
        message: String,
    },

    /// The attempt exceeded its timeout.
    #[error("request to {target} timed out")]
    Timeout {
        /// URL the request was sent to
        target: String,
    },

    /// The receiver answered with a non-2xx status.
    #[error("unexpected HTTP response, expected 2xx, got {status}")]
    UnexpectedStatus {
        /// URL the request was sent to
        target: String,
        /// HTTP status code
        status: u16,
    },

    /// Delivery to the destination failed and no dead-letter sink was
    /// configured.
    #[error("unable to complete request to {target}: {source}")]
    DeliveryFailed {
        /// Destination URL
        target: String,
        /// Failure of the destination hop
        #[source]
        source: Box<DispatchError>,
    },

    /// Delivery to the destination failed and so did the dead-letter sink.
    #[error(
        "unable to complete request to either {target} ({error}) or {dead_letter} \
         ({dead_letter_error})"
    )]
    DeadLetterFailed {
        /// Destination URL
        target: String,
        /// Failure of the destination hop
        error: Box<DispatchError>,
        /// Dead-letter sink URL
        dead_letter: String,
        /// Failure of the dead-letter hop
        dead_letter_error: Box<DispatchError>,
    },

    /// Forwarding the reply failed and no dead-letter sink was configured.
    #[error("failed to forward reply to {target}: {source}")]
    ReplyFailed {
        /// Reply URL
        target: String,
        /// Failure of the reply hop
        #[source]
        source: Box<DispatchError>,
    },

    /// Forwarding the reply failed and so did the dead-letter sink.
    #[error(
        "failed to forward reply to {target} ({error}) and failed to send it to the dead \
         letter sink {dead_letter} ({dead_letter_error})"
    )]
    ReplyAndDeadLetterFailed {
        /// Reply URL
        target: String,
        /// Failure of the reply hop
        error: Box<DispatchError>,
        /// Dead-letter sink URL
        dead_letter: String,
        /// Failure of the dead-letter hop
        dead_letter_error: Box<DispatchError>,
    },

    /// The dispatch was cancelled by its caller.
    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an encoding error.
    pub fn encoding(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Encoding { target: target.into(), message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport { target: target.into(), message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(target: impl Into<String>) -> Self {
        Self::Timeout { target: target.into() }
    }

    /// Creates an unexpected status error.
    pub fn unexpected_status(target: impl Into<String>, status: u16) -> Self {
        Self::UnexpectedStatus { target: target.into(), status }
    }

    /// Maps a reqwest failure onto the transport taxonomy.
    pub fn from_reqwest(target: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::timeout(target);
        }
        if error.is_builder() {
            return Self::configuration(format!("invalid request to {target}: {error}"));
        }
        Self::transport(target, error.to_string())
    }

    /// Returns the URL of the hop that failed first, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Encoding { target, .. }
            | Self::Transport { target, .. }
            | Self::Timeout { target }
            | Self::UnexpectedStatus { target, .. }
            | Self::DeliveryFailed { target, .. }
            | Self::DeadLetterFailed { target, .. }
            | Self::ReplyFailed { target, .. }
            | Self::ReplyAndDeadLetterFailed { target, .. } => Some(target),
            Self::Configuration { .. } | Self::MissingDestination | Self::Cancelled => None,
        }
    }
}

/// Category of dispatch error for metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Problems detected before any I/O.
    Configuration,
    /// Connection failures and timeouts.
    Transport,
    /// Non-2xx responses.
    Protocol,
    /// The dead-letter sink failed as well.
    DeadLetter,
    /// The reply hop failed.
    Reply,
    /// Caller cancellation.
    Cancelled,
}

impl From<&DispatchError> for ErrorCategory {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::Configuration { .. }
            | DispatchError::MissingDestination
            | DispatchError::Encoding { .. } => Self::Configuration,
            DispatchError::Transport { .. } | DispatchError::Timeout { .. } => Self::Transport,
            DispatchError::UnexpectedStatus { .. } => Self::Protocol,
            DispatchError::DeliveryFailed { source, .. } => Self::from(source.as_ref()),
            DispatchError::DeadLetterFailed { .. }
            | DispatchError::ReplyAndDeadLetterFailed { .. } => Self::DeadLetter,
            DispatchError::ReplyFailed { .. } => Self::Reply,
            DispatchError::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transport => write!(f, "transport"),
            Self::Protocol => write!(f, "protocol"),
            Self::DeadLetter => write!(f, "dead_letter"),
            Self::Reply => write!(f, "reply"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_categories_mapped_correctly() {
        let status = DispatchError::unexpected_status("http://a/", 500);
        assert_eq!(ErrorCategory::from(&status), ErrorCategory::Protocol);

        let delivery = DispatchError::DeliveryFailed {
            target: "http://a/".into(),
            source: Box::new(DispatchError::timeout("http://a/")),
        };
        assert_eq!(ErrorCategory::from(&delivery), ErrorCategory::Transport);

        let dead_letter = DispatchError::DeadLetterFailed {
            target: "http://a/".into(),
            error: Box::new(status.clone()),
            dead_letter: "http://dls/".into(),
            dead_letter_error: Box::new(status),
        };
        assert_eq!(ErrorCategory::from(&dead_letter), ErrorCategory::DeadLetter);
        assert_eq!(ErrorCategory::DeadLetter.to_string(), "dead_letter");
    }

    #[test]
    fn combined_errors_name_every_hop() {
        let error = DispatchError::DeadLetterFailed {
            target: "http://dest/".into(),
            error: Box::new(DispatchError::unexpected_status("http://dest/", 500)),
            dead_letter: "http://dls/".into(),
            dead_letter_error: Box::new(DispatchError::transport("http://dls/", "refused")),
        };

        assert_eq!(
            error.to_string(),
            "unable to complete request to either http://dest/ (unexpected HTTP response, \
             expected 2xx, got 500) or http://dls/ (request to http://dls/ failed: refused)"
        );
        assert_eq!(error.target(), Some("http://dest/"));
    }

    #[test]
    fn error_display_format() {
        let error = DispatchError::DeliveryFailed {
            target: "http://dest/".into(),
            source: Box::new(DispatchError::unexpected_status("http://dest/", 500)),
        };
        assert_eq!(
            error.to_string(),
            "unable to complete request to http://dest/: unexpected HTTP response, expected \
             2xx, got 500"
        );
    }
}
