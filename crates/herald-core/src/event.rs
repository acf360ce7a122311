//! Structured events following the CloudEvents 1.0 attribute model.
//!
//! Events are immutable once built. Every "modification" (adding an
//! extension, assigning a fresh id) returns a new event and leaves the
//! original untouched, so one event can be dispatched many times without
//! copies interfering with each other.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// The only CloudEvents spec version this crate reads and writes.
pub const SPEC_VERSION: &str = "1.0";

/// Attribute names that can never be used as extensions.
const RESERVED_ATTRIBUTES: &[&str] = &[
    "specversion",
    "id",
    "source",
    "type",
    "subject",
    "time",
    "datacontenttype",
    "dataschema",
    "data",
    "data_base64",
];

/// Scalar value of an extension attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionValue {
    /// Boolean extension.
    Boolean(bool),
    /// Integer extension.
    Integer(i64),
    /// String extension.
    String(String),
}

impl ExtensionValue {
    /// Returns the string value, if this is a string extension.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ExtensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u16> for ExtensionValue {
    fn from(value: u16) -> Self {
        Self::Integer(i64::from(value))
    }
}

/// An immutable structured event.
///
/// # Example
///
/// ```
/// use herald_core::Event;
///
/// let event = Event::builder()
///     .source("/sources/ping")
///     .ty("dev.herald.ping")
///     .json_data(&serde_json::json!({"hello": "world"}))
///     .build()
///     .unwrap();
///
/// let tagged = event.with_extension("tenant", "acme").unwrap();
/// assert!(event.extension("tenant").is_none());
/// assert_eq!(tagged.id(), event.id());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    id: String,
    source: String,
    ty: String,
    spec_version: String,
    subject: Option<String>,
    time: Option<DateTime<Utc>>,
    data_content_type: Option<String>,
    data_schema: Option<String>,
    data: Bytes,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl Event {
    /// Starts building a new event.
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    /// Unique event identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Context in which the event happened.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Event type.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// CloudEvents spec version.
    pub fn spec_version(&self) -> &str {
        &self.spec_version
    }

    /// Subject of the event within the source.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Occurrence timestamp.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    /// Content type of the payload.
    pub fn data_content_type(&self) -> Option<&str> {
        self.data_content_type.as_deref()
    }

    /// Schema the payload adheres to.
    pub fn data_schema(&self) -> Option<&str> {
        self.data_schema.as_deref()
    }

    /// Payload bytes. Empty when the event carries no data.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Looks up an extension attribute.
    pub fn extension(&self, name: &str) -> Option<&ExtensionValue> {
        self.extensions.get(name)
    }

    /// All extension attributes in name order.
    pub fn extensions(&self) -> &BTreeMap<String, ExtensionValue> {
        &self.extensions
    }

    /// Returns a copy of this event with the extension set.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidEvent` if the name is not a valid
    /// extension name.
    pub fn with_extension(
        &self,
        name: impl Into<String>,
        value: impl Into<ExtensionValue>,
    ) -> Result<Self> {
        let name = name.into();
        validate_extension_name(&name)?;

        let mut event = self.clone();
        event.extensions.insert(name, value.into());
        Ok(event)
    }

    /// Returns a copy of this event under a freshly generated id.
    ///
    /// Used when the system originates the event again itself (a scheduled
    /// tick re-sending its template). Retries and forwarding keep the id.
    #[must_use]
    pub fn reoriginate(&self) -> Self {
        let mut event = self.clone();
        event.id = Uuid::new_v4().to_string();
        event
    }

    /// Returns a builder pre-populated with this event's attributes.
    pub fn to_builder(&self) -> EventBuilder {
        EventBuilder {
            id: Some(self.id.clone()),
            source: Some(self.source.clone()),
            ty: Some(self.ty.clone()),
            spec_version: Some(self.spec_version.clone()),
            subject: self.subject.clone(),
            time: self.time,
            data_content_type: self.data_content_type.clone(),
            data_schema: self.data_schema.clone(),
            data: self.data.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

/// Builder for [`Event`].
///
/// A missing id is filled with a random UUID. `source` and `type` are
/// required.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    id: Option<String>,
    source: Option<String>,
    ty: Option<String>,
    spec_version: Option<String>,
    subject: Option<String>,
    time: Option<DateTime<Utc>>,
    data_content_type: Option<String>,
    data_schema: Option<String>,
    data: Bytes,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl EventBuilder {
    /// Sets the event id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the event source.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the event type.
    #[must_use]
    pub fn ty(mut self, ty: impl Into<String>) -> Self {
        self.ty = Some(ty.into());
        self
    }

    /// Sets the spec version. Defaults to `1.0`.
    #[must_use]
    pub fn spec_version(mut self, version: impl Into<String>) -> Self {
        self.spec_version = Some(version.into());
        self
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the occurrence time.
    #[must_use]
    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets the data schema.
    #[must_use]
    pub fn data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    /// Sets the payload together with its content type.
    #[must_use]
    pub fn data(mut self, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.data_content_type = Some(content_type.into());
        self.data = data.into();
        self
    }

    /// Sets a JSON payload with `application/json` content type.
    #[must_use]
    pub fn json_data(self, value: &serde_json::Value) -> Self {
        self.data("application/json", value.to_string())
    }

    /// Sets the content type without touching the payload.
    #[must_use]
    pub fn data_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.data_content_type = Some(content_type.into());
        self
    }

    /// Sets the payload without touching the content type.
    #[must_use]
    pub fn raw_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Adds an extension attribute. Names are validated at `build`.
    #[must_use]
    pub fn extension(mut self, name: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    /// Validates and builds the event.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidEvent` when `source` or `type` is missing
    /// or empty, the id is empty, or an extension name is invalid.
    pub fn build(self) -> Result<Event> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.is_empty() {
            return Err(CoreError::invalid_event("id must not be empty"));
        }

        let source = self
            .source
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::invalid_event("source is required"))?;
        let ty = self
            .ty
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CoreError::invalid_event("type is required"))?;

        for name in self.extensions.keys() {
            validate_extension_name(name)?;
        }

        Ok(Event {
            id,
            source,
            ty,
            spec_version: self.spec_version.unwrap_or_else(|| SPEC_VERSION.to_string()),
            subject: self.subject,
            time: self.time,
            data_content_type: self.data_content_type,
            data_schema: self.data_schema,
            data: self.data,
            extensions: self.extensions,
        })
    }
}

/// Checks an extension name: lowercase ASCII letters and digits, not a
/// reserved context attribute.
pub fn validate_extension_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_event("extension name must not be empty"));
    }

    if !name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
        return Err(CoreError::invalid_event(format!(
            "extension name {name:?} must only contain lowercase letters and digits"
        )));
    }

    if RESERVED_ATTRIBUTES.contains(&name) {
        return Err(CoreError::invalid_event(format!(
            "extension name {name:?} collides with a context attribute"
        )));
    }

    Ok(())
}
