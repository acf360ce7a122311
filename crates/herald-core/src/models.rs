//! Destination identities.
//!
//! An [`Addressable`] is a resolved destination: a URL plus optional trust
//! material. The URL's string form is the identity used for connection
//! pooling, so two addressables with the same URL share a pooled client even
//! when their certificates differ.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::{ParseError, Url};

use crate::error::{CoreError, Result};

/// A resolved destination identity.
///
/// The URL is optional because destination resolution can be partial; the
/// dispatch pipeline rejects an addressable without a URL before any I/O.
///
/// # Example
///
/// ```
/// use herald_core::Addressable;
///
/// let sink = Addressable::parse("https://sink.example.com/events").unwrap();
/// assert_eq!(sink.pool_key(), Some("https://sink.example.com/events"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressable {
    /// Destination URL.
    pub url: Option<Url>,
    /// PEM bundle of CA certificates trusted in addition to the system roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certs: Option<String>,
}

impl Addressable {
    /// Creates an addressable for the given URL with no trust material.
    pub fn new(url: Url) -> Self {
        Self { url: Some(url), ca_certs: None }
    }

    /// Parses a destination URL.
    ///
    /// Input that carries no scheme at all (only a host was resolved, as in
    /// `sink.default.svc.cluster.local`) is read as `http://<host>/`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidAddressable` if the input is not a URL and
    /// not a bare host either.
    pub fn parse(input: &str) -> Result<Self> {
        let url = match Url::parse(input) {
            Ok(url) => url,
            Err(ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("http://{input}/"))
                .map_err(|e| {
                    CoreError::invalid_addressable(format!("invalid destination {input:?}: {e}"))
                })?,
            Err(e) => {
                return Err(CoreError::invalid_addressable(format!(
                    "invalid destination {input:?}: {e}"
                )))
            },
        };

        Ok(Self::new(url))
    }

    /// Attaches a PEM bundle of CA certificates.
    #[must_use]
    pub fn with_ca_certs(mut self, pem: impl Into<String>) -> Self {
        self.ca_certs = Some(pem.into());
        self
    }

    /// Returns the pooling identity: the URL's string form.
    pub fn pool_key(&self) -> Option<&str> {
        self.url.as_ref().map(Url::as_str)
    }

    /// Returns the CA bundle if one is configured and non-empty.
    pub fn ca_certs(&self) -> Option<&str> {
        self.ca_certs.as_deref().filter(|pem| !pem.trim().is_empty())
    }
}

impl From<Url> for Addressable {
    fn from(url: Url) -> Self {
        Self::new(url)
    }
}

impl fmt::Display for Addressable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.url {
            Some(url) => write!(f, "{url}"),
            None => write!(f, "<no url>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_url() {
        let addressable = Addressable::parse("https://example.com/path").unwrap();
        assert_eq!(addressable.pool_key(), Some("https://example.com/path"));
        assert!(addressable.ca_certs().is_none());
    }

    #[test]
    fn bare_host_becomes_http_root() {
        let addressable = Addressable::parse("sink.default.svc.cluster.local").unwrap();
        assert_eq!(addressable.pool_key(), Some("http://sink.default.svc.cluster.local/"));
    }

    #[test]
    fn garbage_rejected() {
        let result = Addressable::parse("http://exa mple.com");
        assert!(matches!(result, Err(CoreError::InvalidAddressable { .. })));
    }

    #[test]
    fn blank_ca_bundle_treated_as_absent() {
        let addressable = Addressable::parse("https://example.com").unwrap().with_ca_certs("  \n");
        assert!(addressable.ca_certs().is_none());
    }

    #[test]
    fn missing_url_has_no_pool_key() {
        let addressable = Addressable::default();
        assert!(addressable.pool_key().is_none());
        assert_eq!(addressable.to_string(), "<no url>");
    }
}
