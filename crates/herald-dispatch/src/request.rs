//! Outbound request construction and event transformers.
//!
//! Requests are always `POST`s carrying one event in the CloudEvents HTTP
//! binding. Caller headers are laid over the binding's headers, and the
//! destination hop additionally asks for a reply with `Prefer: reply`.
//!
//! When a hop fails and the event goes to a dead-letter sink instead, the
//! failure is described on the event itself through three extensions:
//! the failing URL, the status code and the (base64, truncated) response
//! body.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use herald_core::{Addressable, Encoding, Event, ExtensionValue};
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, Method,
};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{
    error::{DispatchError, Result},
    DispatchInfo,
};

/// Header asking the destination to answer with an event.
pub const PREFER_HEADER: &str = "prefer";

/// Value of the [`PREFER_HEADER`].
pub const PREFER_REPLY: &str = "reply";

/// Header naming the namespace a request originates from.
pub const NAMESPACE_HEADER: &str = "kn-namespace";

/// Host of the platform's internal filter component. Failures reported by
/// it carry the real failure point in their body.
pub const DEFAULT_FILTER_HOST: &str = "broker-filter.knative-eventing.svc.cluster.local";

/// Extension carrying the URL of the hop that failed.
pub const ERROR_DESTINATION_EXTENSION: &str = "knativeerrordest";

/// Extension carrying the status code of the failed hop.
pub const ERROR_CODE_EXTENSION: &str = "knativeerrorcode";

/// Extension carrying the base64 response body of the failed hop.
pub const ERROR_DATA_EXTENSION: &str = "knativeerrordata";

/// Maximum length of the encoded [`ERROR_DATA_EXTENSION`] value.
pub const ERROR_DATA_MAX_LEN: usize = 1024;

/// Response headers forwarded from a receiver back to the caller.
const PASS_THROUGH_HEADERS: &[&str] =
    &["x-request-id", "b3", "traceparent", "tracestate", "retry-after"];
const PASS_THROUGH_PREFIXES: &[&str] = &["knative-", "kn-", "x-b3-", "x-ot-"];

/// Which leg of the pipeline a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    /// The primary destination.
    Destination,
    /// Forwarding of the destination's reply.
    Reply,
    /// The dead-letter sink.
    DeadLetter,
    /// A standalone send outside the pipeline.
    Direct,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destination => write!(f, "destination"),
            Self::Reply => write!(f, "reply"),
            Self::DeadLetter => write!(f, "dead_letter"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// A change applied to an event right before it is written on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformer {
    /// Sets an extension attribute.
    AddExtension {
        /// Extension name
        name: String,
        /// Extension value
        value: ExtensionValue,
    },
}

impl Transformer {
    /// Sets an extension attribute.
    pub fn add_extension(name: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        Self::AddExtension { name: name.into(), value: value.into() }
    }

    fn apply(&self, event: &Event) -> herald_core::Result<Event> {
        match self {
            Self::AddExtension { name, value } => event.with_extension(name.as_str(), value.clone()),
        }
    }
}

/// An ordered list of transformers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transformers(Vec<Transformer>);

impl Transformers {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transformer.
    pub fn push(&mut self, transformer: Transformer) {
        self.0.push(transformer);
    }

    /// Returns true when there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the transformers in order.
    pub fn iter(&self) -> impl Iterator<Item = &Transformer> {
        self.0.iter()
    }

    /// Applies every transformer to a copy of the event.
    ///
    /// # Errors
    ///
    /// Returns the event error if a transformer produces an invalid event.
    pub fn apply(&self, event: &Event) -> herald_core::Result<Event> {
        self.0.iter().try_fold(event.clone(), |event, transformer| transformer.apply(&event))
    }
}

impl From<Vec<Transformer>> for Transformers {
    fn from(transformers: Vec<Transformer>) -> Self {
        Self(transformers)
    }
}

/// Builds the request for one hop.
///
/// The event is transformed on a copy, written in the requested encoding,
/// and the caller's headers are laid over the binding's. The destination
/// hop always carries `Prefer: reply`, whether or not a reply target is
/// configured.
///
/// # Errors
///
/// Returns `DispatchError::MissingDestination` when the target has no URL
/// and `DispatchError::Encoding` when the event cannot be written.
pub fn build_request(
    event: &Event,
    target: &Addressable,
    headers: &HeaderMap,
    hop: Hop,
    encoding: Encoding,
    transformers: &Transformers,
) -> Result<reqwest::Request> {
    let url = target.url.as_ref().ok_or(DispatchError::MissingDestination)?;

    let event = transformers
        .apply(event)
        .map_err(|e| DispatchError::encoding(url.as_str(), e.to_string()))?;
    let message = herald_core::write_message(&event, encoding)
        .map_err(|e| DispatchError::encoding(url.as_str(), e.to_string()))?;

    let mut request = reqwest::Request::new(Method::POST, url.clone());
    let request_headers = request.headers_mut();
    request_headers.extend(message.headers);
    for name in headers.keys().filter(|name| !is_managed_header(name)) {
        request_headers.remove(name);
        for value in headers.get_all(name) {
            request_headers.append(name.clone(), value.clone());
        }
    }
    if hop == Hop::Destination {
        request_headers
            .insert(HeaderName::from_static(PREFER_HEADER), HeaderValue::from_static(PREFER_REPLY));
    }

    *request.body_mut() = Some(reqwest::Body::from(message.body));
    Ok(request)
}

/// Checks if a header is managed by the transport and should not be copied
/// from caller headers.
fn is_managed_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Keeps the response headers that are forwarded to the caller: tracing
/// context, request ids, `Retry-After`, and platform headers.
pub fn pass_through_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        if PASS_THROUGH_HEADERS.contains(&name_str)
            || PASS_THROUGH_PREFIXES.iter().any(|prefix| name_str.starts_with(prefix))
        {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

/// Rewrites URLs without an `http`/`https` scheme to `http://<host>/`.
pub fn sanitize_url(url: &Url) -> Url {
    if matches!(url.scheme(), "http" | "https") {
        return url.clone();
    }

    let host = url.host_str().unwrap_or_default();
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Url::parse(&format!("http://{authority}/")).unwrap_or_else(|_| url.clone())
}

/// Sanitizes the URL of an addressable, keeping its trust material.
pub fn sanitize_addressable(addressable: &Addressable) -> Addressable {
    Addressable {
        url: addressable.url.as_ref().map(sanitize_url),
        ca_certs: addressable.ca_certs.clone(),
    }
}

/// Error context the filter component puts in its failure responses.
#[derive(Debug, Deserialize)]
struct ErrExtensionInfo {
    #[serde(rename = "errdestination")]
    destination: Option<Url>,
    #[serde(rename = "errresponsebody", default, with = "base64_bytes")]
    response_body: Bytes,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

/// Builds the transformers describing a failed hop, applied to the original
/// event before it goes to the dead-letter sink.
///
/// When the failing destination is the filter component at `filter_host`,
/// its response body is unpacked first to recover the real failing
/// destination and body. If that body does not parse, no transformers are
/// produced.
pub fn dispatch_execution_info_transformers(
    destination: Option<&Url>,
    info: &DispatchInfo,
    filter_host: &str,
) -> Transformers {
    let mut destination = destination.cloned();
    let mut body = info.response_body.clone();

    if destination.as_ref().and_then(Url::host_str) == Some(filter_host) {
        match serde_json::from_slice::<ErrExtensionInfo>(&info.response_body) {
            Ok(inner) => {
                destination = inner.destination;
                body = inner.response_body;
            },
            Err(e) => {
                debug!(filter_host, "could not unpack filter error context: {e}");
                return Transformers::new();
            },
        }
    }

    let destination = destination.as_ref().map(sanitize_url);
    let code = info.response_code.map_or(-1, |status| i64::from(status.as_u16()));
    let mut data = STANDARD.encode(&body);
    data.truncate(ERROR_DATA_MAX_LEN);

    let mut transformers = Transformers::new();
    transformers.push(Transformer::add_extension(
        ERROR_DESTINATION_EXTENSION,
        destination.map(String::from).unwrap_or_default(),
    ));
    transformers.push(Transformer::add_extension(ERROR_CODE_EXTENSION, code));
    if !data.is_empty() {
        transformers.push(Transformer::add_extension(ERROR_DATA_EXTENSION, data));
    }
    transformers
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;

    use super::*;

    fn event() -> Event {
        Event::builder()
            .id("evt-1")
            .source("/tests")
            .ty("dev.herald.test")
            .data("text/plain", "payload")
            .build()
            .unwrap()
    }

    fn failed(code: u16, body: impl Into<Bytes>) -> DispatchInfo {
        DispatchInfo {
            duration: Some(Duration::from_millis(3)),
            response_code: Some(StatusCode::from_u16(code).unwrap()),
            response_headers: HeaderMap::new(),
            response_body: body.into(),
        }
    }

    #[test]
    fn destination_hop_prefers_reply() {
        let target = Addressable::parse("http://sink.example.com/").unwrap();
        let request = build_request(
            &event(),
            &target,
            &HeaderMap::new(),
            Hop::Destination,
            Encoding::Binary,
            &Transformers::new(),
        )
        .unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().as_str(), "http://sink.example.com/");
        assert_eq!(request.headers()[PREFER_HEADER], PREFER_REPLY);
        assert_eq!(request.headers()["ce-id"], "evt-1");
    }

    #[test]
    fn other_hops_do_not_prefer_reply() {
        let target = Addressable::parse("http://dls.example.com/").unwrap();
        for hop in [Hop::Reply, Hop::DeadLetter] {
            let request = build_request(
                &event(),
                &target,
                &HeaderMap::new(),
                hop,
                Encoding::Binary,
                &Transformers::new(),
            )
            .unwrap();
            assert!(request.headers().get(PREFER_HEADER).is_none(), "{hop} set Prefer");
        }
    }

    #[test]
    fn caller_headers_merged_without_managed_ones() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("yes"));
        headers.insert("host", HeaderValue::from_static("evil.example.com"));
        headers.insert(NAMESPACE_HEADER, HeaderValue::from_static("default"));

        let target = Addressable::parse("http://sink.example.com/").unwrap();
        let request = build_request(
            &event(),
            &target,
            &headers,
            Hop::Reply,
            Encoding::Binary,
            &Transformers::new(),
        )
        .unwrap();

        assert_eq!(request.headers()["x-custom"], "yes");
        assert_eq!(request.headers()[NAMESPACE_HEADER], "default");
        assert!(request.headers().get("host").is_none());
    }

    #[test]
    fn transformers_apply_to_a_copy() {
        let original = event();
        let transformers = Transformers::from(vec![Transformer::add_extension("attempt", 2_i64)]);
        let target = Addressable::parse("http://sink.example.com/").unwrap();

        let request = build_request(
            &original,
            &target,
            &HeaderMap::new(),
            Hop::DeadLetter,
            Encoding::Binary,
            &transformers,
        )
        .unwrap();

        assert_eq!(request.headers()["ce-attempt"], "2");
        assert!(original.extension("attempt").is_none());
    }

    #[test]
    fn missing_url_rejected() {
        let result = build_request(
            &event(),
            &Addressable::default(),
            &HeaderMap::new(),
            Hop::Destination,
            Encoding::Binary,
            &Transformers::new(),
        );
        assert!(matches!(result, Err(DispatchError::MissingDestination)));
    }

    #[test]
    fn urls_without_http_scheme_sanitized() {
        let url = Url::parse("kafka://broker.example.com:9092/topic").unwrap();
        assert_eq!(sanitize_url(&url).as_str(), "http://broker.example.com:9092/");

        let url = Url::parse("https://sink.example.com/path?q=1").unwrap();
        assert_eq!(sanitize_url(&url), url);
    }

    #[test]
    fn failure_transformers_describe_the_hop() {
        let destination = Url::parse("http://sink.example.com/").unwrap();
        let transformers =
            dispatch_execution_info_transformers(Some(&destination), &failed(503, "busy"), DEFAULT_FILTER_HOST);

        let extensions: Vec<_> = transformers.iter().cloned().collect();
        assert_eq!(
            extensions,
            vec![
                Transformer::add_extension(ERROR_DESTINATION_EXTENSION, "http://sink.example.com/"),
                Transformer::add_extension(ERROR_CODE_EXTENSION, 503_i64),
                Transformer::add_extension(ERROR_DATA_EXTENSION, STANDARD.encode("busy")),
            ]
        );
    }

    #[test]
    fn empty_body_omits_error_data() {
        let destination = Url::parse("http://sink.example.com/").unwrap();
        let transformers =
            dispatch_execution_info_transformers(Some(&destination), &failed(500, ""), DEFAULT_FILTER_HOST);

        assert_eq!(transformers.iter().count(), 2);
        assert!(transformers.iter().all(|t| !matches!(
            t,
            Transformer::AddExtension { name, .. } if name == ERROR_DATA_EXTENSION
        )));
    }

    #[test]
    fn error_data_truncated() {
        let destination = Url::parse("http://sink.example.com/").unwrap();
        let info = failed(500, vec![b'x'; 4096]);
        let transformers =
            dispatch_execution_info_transformers(Some(&destination), &info, DEFAULT_FILTER_HOST);

        let data = transformers.iter().find_map(|t| match t {
            Transformer::AddExtension { name, value } if name == ERROR_DATA_EXTENSION => {
                value.as_str().map(str::len)
            },
            _ => None,
        });
        assert_eq!(data, Some(ERROR_DATA_MAX_LEN));
    }

    #[test]
    fn filter_failures_unpacked() {
        let filter = Url::parse(&format!("http://{DEFAULT_FILTER_HOST}/ns/broker")).unwrap();
        let nested = serde_json::json!({
            "errdestination": "kafka://subscriber.default.svc:8080/",
            "errresponsebody": STANDARD.encode("subscriber down"),
        });
        let info = failed(502, nested.to_string());

        let transformers =
            dispatch_execution_info_transformers(Some(&filter), &info, DEFAULT_FILTER_HOST);
        let extensions: Vec<_> = transformers.iter().cloned().collect();

        assert_eq!(
            extensions,
            vec![
                Transformer::add_extension(
                    ERROR_DESTINATION_EXTENSION,
                    "http://subscriber.default.svc:8080/"
                ),
                Transformer::add_extension(ERROR_CODE_EXTENSION, 502_i64),
                Transformer::add_extension(ERROR_DATA_EXTENSION, STANDARD.encode("subscriber down")),
            ]
        );
    }

    #[test]
    fn unparsable_filter_body_yields_nothing() {
        let filter = Url::parse(&format!("http://{DEFAULT_FILTER_HOST}/")).unwrap();
        let transformers =
            dispatch_execution_info_transformers(Some(&filter), &failed(500, "oops"), DEFAULT_FILTER_HOST);
        assert!(transformers.is_empty());
    }

    #[test]
    fn only_forwarded_headers_pass_through() {
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static("00-abc-def-01"));
        headers.insert("knative-trace", HeaderValue::from_static("1"));
        headers.insert("retry-after", HeaderValue::from_static("5"));
        headers.insert("set-cookie", HeaderValue::from_static("secret"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let forwarded = pass_through_headers(&headers);
        assert_eq!(forwarded.len(), 3);
        assert!(forwarded.get("set-cookie").is_none());
        assert!(forwarded.get("content-type").is_none());
    }
}
