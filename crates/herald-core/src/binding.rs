//! CloudEvents HTTP protocol binding.
//!
//! Writes events onto HTTP messages in binary mode (attributes as `ce-*`
//! headers, payload as the body) or structured mode (the whole event as an
//! `application/cloudevents+json` document), and reads them back from
//! inbound responses. Batched messages are reported as such but not decoded.

use std::{borrow::Cow, collections::BTreeMap};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http::{
    header::{HeaderName, HeaderValue, CONTENT_TYPE},
    HeaderMap,
};
use serde::Serialize;
use serde_json::{value::RawValue, Map, Value};

use crate::{
    error::{CoreError, Result},
    event::{Event, ExtensionValue, SPEC_VERSION},
};

/// Prefix of binary-mode attribute headers.
pub const HEADER_PREFIX: &str = "ce-";

/// Content type of a structured-mode message.
pub const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

const STRUCTURED_PREFIX: &str = "application/cloudevents";
const BATCH_PREFIX: &str = "application/cloudevents-batch";

/// Outbound encoding mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// Attributes in `ce-*` headers, payload as the body.
    #[default]
    Binary,
    /// Whole event as a JSON document.
    Structured,
}

/// Encoding detected on an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEncoding {
    /// Binary mode.
    Binary,
    /// Structured mode.
    Structured,
    /// Batched structured mode.
    Batch,
    /// Not an event.
    Unknown,
}

/// Headers and body of an encoded event.
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    /// Headers carrying attributes (binary) or the content type (structured).
    pub headers: HeaderMap,
    /// Message body.
    pub body: Bytes,
}

/// Writes an event onto a new HTTP message.
///
/// # Errors
///
/// Returns `CoreError::Encode` if an attribute cannot be represented as a
/// header value or structured serialization fails.
pub fn write_message(event: &Event, encoding: Encoding) -> Result<HttpMessage> {
    match encoding {
        Encoding::Binary => write_binary(event),
        Encoding::Structured => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(STRUCTURED_CONTENT_TYPE));
            Ok(HttpMessage { headers, body: Bytes::from(to_structured_json(event)?) })
        },
    }
}

fn write_binary(event: &Event) -> Result<HttpMessage> {
    let mut headers = HeaderMap::new();

    insert_attribute(&mut headers, "specversion", event.spec_version())?;
    insert_attribute(&mut headers, "id", event.id())?;
    insert_attribute(&mut headers, "source", event.source())?;
    insert_attribute(&mut headers, "type", event.ty())?;
    if let Some(subject) = event.subject() {
        insert_attribute(&mut headers, "subject", subject)?;
    }
    if let Some(time) = event.time() {
        insert_attribute(&mut headers, "time", &format_time(time))?;
    }
    if let Some(schema) = event.data_schema() {
        insert_attribute(&mut headers, "dataschema", schema)?;
    }
    for (name, value) in event.extensions() {
        insert_attribute(&mut headers, name, &value.to_string())?;
    }

    if let Some(content_type) = event.data_content_type() {
        let value = HeaderValue::from_str(content_type)
            .map_err(|e| CoreError::encode(format!("content type {content_type:?}: {e}")))?;
        headers.insert(CONTENT_TYPE, value);
    }

    Ok(HttpMessage { headers, body: event.data().clone() })
}

fn insert_attribute(headers: &mut HeaderMap, attribute: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(format!("{HEADER_PREFIX}{attribute}").as_bytes())
        .map_err(|e| CoreError::encode(format!("attribute {attribute:?}: {e}")))?;
    let value = HeaderValue::from_str(&percent_encode(value))
        .map_err(|e| CoreError::encode(format!("attribute {attribute:?}: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

/// Detects how an inbound message carries its event, if at all.
pub fn read_encoding(headers: &HeaderMap) -> MessageEncoding {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if content_type.starts_with(BATCH_PREFIX) {
        MessageEncoding::Batch
    } else if content_type.starts_with(STRUCTURED_PREFIX) {
        MessageEncoding::Structured
    } else if headers.contains_key("ce-specversion") {
        MessageEncoding::Binary
    } else {
        MessageEncoding::Unknown
    }
}

/// Reads an event from an inbound message.
///
/// Returns `Ok(None)` when the message does not carry a single event
/// (unknown encoding or a batch).
///
/// # Errors
///
/// Returns `CoreError::Decode` when the message claims to carry an event but
/// the event is malformed.
pub fn read_event(headers: &HeaderMap, body: Bytes) -> Result<Option<Event>> {
    match read_encoding(headers) {
        MessageEncoding::Unknown | MessageEncoding::Batch => Ok(None),
        MessageEncoding::Structured => from_structured_json(&body).map(Some),
        MessageEncoding::Binary => read_binary(headers, body).map(Some),
    }
}

fn read_binary(headers: &HeaderMap, body: Bytes) -> Result<Event> {
    let mut builder = Event::builder();
    let mut spec_version = None;
    let mut id = None;

    for (name, value) in headers {
        let Some(attribute) = name.as_str().strip_prefix(HEADER_PREFIX) else {
            continue;
        };
        let raw = value
            .to_str()
            .map_err(|e| CoreError::decode(format!("header {name}: {e}")))?;
        let value = percent_decode(raw)?;

        builder = match attribute {
            "specversion" => {
                spec_version = Some(value);
                builder
            },
            "id" => {
                id = Some(value);
                builder
            },
            "source" => builder.source(value),
            "type" => builder.ty(value),
            "subject" => builder.subject(value),
            "time" => builder.time(parse_time(&value)?),
            "dataschema" => builder.data_schema(value),
            _ => builder.extension(attribute, value),
        };
    }

    check_spec_version(spec_version.as_deref())?;
    builder = builder.id(id.ok_or_else(|| CoreError::decode("missing required attribute id"))?);

    if let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        builder = builder.data_content_type(content_type);
    }

    builder.raw_data(body).build().map_err(into_decode)
}

/// Serializes an event as a structured-mode JSON document.
///
/// # Errors
///
/// Returns `CoreError::Encode` if serialization fails.
pub fn to_structured_json(event: &Event) -> Result<Vec<u8>> {
    let mut doc = Map::new();
    doc.insert("specversion".into(), Value::from(event.spec_version()));
    doc.insert("id".into(), Value::from(event.id()));
    doc.insert("source".into(), Value::from(event.source()));
    doc.insert("type".into(), Value::from(event.ty()));
    if let Some(subject) = event.subject() {
        doc.insert("subject".into(), Value::from(subject));
    }
    if let Some(time) = event.time() {
        doc.insert("time".into(), Value::from(format_time(time)));
    }
    if let Some(content_type) = event.data_content_type() {
        doc.insert("datacontenttype".into(), Value::from(content_type));
    }
    if let Some(schema) = event.data_schema() {
        doc.insert("dataschema".into(), Value::from(schema));
    }
    for (name, value) in event.extensions() {
        let value = serde_json::to_value(value).map_err(|e| CoreError::encode(e.to_string()))?;
        doc.insert(name.clone(), value);
    }

    let payload = event.data();
    let mut data = None;
    if !payload.is_empty() {
        let content_type = event.data_content_type();
        let raw = is_json(content_type)
            .then(|| serde_json::from_slice::<&RawValue>(payload).ok())
            .flatten();

        match raw {
            Some(raw) => data = Some(raw),
            None => match std::str::from_utf8(payload) {
                Ok(text) if is_text(content_type) => {
                    doc.insert("data".into(), Value::from(text));
                },
                _ => {
                    doc.insert("data_base64".into(), Value::from(STANDARD.encode(payload)));
                },
            },
        }
    }

    serde_json::to_vec(&StructuredDocument { attributes: doc, data })
        .map_err(|e| CoreError::encode(e.to_string()))
}

/// JSON payloads are embedded as written so key order and number precision
/// survive.
#[derive(Serialize)]
struct StructuredDocument<'a> {
    #[serde(flatten)]
    attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a RawValue>,
}

/// Parses a structured-mode JSON document.
///
/// # Errors
///
/// Returns `CoreError::Decode` when the document is not a JSON object, has
/// an unsupported spec version, misses required attributes, or carries
/// non-scalar extensions.
pub fn from_structured_json(body: &[u8]) -> Result<Event> {
    let doc: BTreeMap<String, &RawValue> =
        serde_json::from_slice(body).map_err(|e| CoreError::decode(e.to_string()))?;

    let mut builder = Event::builder();
    let mut data = None;
    let mut spec_version = None;
    let mut id = None;

    for (key, raw) in doc {
        if key == "data" {
            data = Some(raw);
            continue;
        }
        let value: Value =
            serde_json::from_str(raw.get()).map_err(|e| CoreError::decode(e.to_string()))?;
        builder = match key.as_str() {
            "specversion" => {
                spec_version = Some(string_attribute(&key, value)?);
                builder
            },
            "id" => {
                id = Some(string_attribute(&key, value)?);
                builder
            },
            "source" => builder.source(string_attribute(&key, value)?),
            "type" => builder.ty(string_attribute(&key, value)?),
            "subject" => builder.subject(string_attribute(&key, value)?),
            "time" => builder.time(parse_time(&string_attribute(&key, value)?)?),
            "datacontenttype" => builder.data_content_type(string_attribute(&key, value)?),
            "dataschema" => builder.data_schema(string_attribute(&key, value)?),
            "data_base64" => {
                let encoded = string_attribute(&key, value)?;
                let bytes = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| CoreError::decode(format!("data_base64: {e}")))?;
                builder.raw_data(bytes)
            },
            _ => builder.extension(key.as_str(), extension_value(&key, value)?),
        };
    }

    check_spec_version(spec_version.as_deref())?;
    builder = builder.id(id.ok_or_else(|| CoreError::decode("missing required attribute id"))?);

    // The content type decides how `data` is carried, so it is read first.
    let event = builder.build().map_err(into_decode)?;
    let Some(data) = data else {
        return Ok(event);
    };

    let raw = data.get();
    let bytes = if raw == "null" {
        Bytes::new()
    } else if raw.starts_with('"') && !is_json(event.data_content_type()) {
        let text: String =
            serde_json::from_str(raw).map_err(|e| CoreError::decode(format!("data: {e}")))?;
        Bytes::from(text)
    } else {
        Bytes::copy_from_slice(raw.as_bytes())
    };
    event.to_builder().raw_data(bytes).build().map_err(into_decode)
}

fn string_attribute(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(CoreError::decode(format!("attribute {key:?} must be a string, got {other}"))),
    }
}

fn extension_value(key: &str, value: Value) -> Result<ExtensionValue> {
    match value {
        Value::String(s) => Ok(ExtensionValue::String(s)),
        Value::Bool(b) => Ok(ExtensionValue::Boolean(b)),
        Value::Number(n) => n
            .as_i64()
            .map(ExtensionValue::Integer)
            .ok_or_else(|| CoreError::decode(format!("extension {key:?} is not an integer"))),
        other => Err(CoreError::decode(format!("extension {key:?} has non-scalar value {other}"))),
    }
}

fn check_spec_version(version: Option<&str>) -> Result<()> {
    match version {
        Some(SPEC_VERSION) => Ok(()),
        Some(other) => Err(CoreError::decode(format!("unsupported spec version {other:?}"))),
        None => Err(CoreError::decode("missing required attribute specversion")),
    }
}

fn into_decode(error: CoreError) -> CoreError {
    match error {
        CoreError::InvalidEvent { message } => CoreError::Decode { message },
        other => other,
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::decode(format!("time {value:?}: {e}")))
}

/// Absent content type means JSON in structured mode.
fn is_json(content_type: Option<&str>) -> bool {
    content_type.map_or(true, |ct| {
        let media = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        media == "application/json" || media == "text/json" || media.ends_with("+json")
    })
}

fn is_text(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("text/"))
}

/// Percent-encodes a header value: space, `"`, `%` and anything outside
/// printable ASCII. Other punctuation such as `/` stays readable, which
/// `urlencoding::encode` would escape.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b' ' | b'"' | b'%' => out.push_str(&format!("%{byte:02X}")),
            0x21..=0x7E => out.push(char::from(byte)),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(value: &str) -> Result<String> {
    urlencoding::decode(value)
        .map(Cow::into_owned)
        .map_err(|e| CoreError::decode(format!("header value: {e}")))
}
