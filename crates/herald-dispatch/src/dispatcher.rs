//! Three-hop dispatch pipeline: destination, dead letter, reply.
//!
//! ```text
//!              ┌───────────────┐  fail   ┌─────────────────┐
//!   event ───▶ │  destination  │ ──────▶ │ dead-letter sink│ ──▶ done / combined error
//!              └───────────────┘         └─────────────────┘
//!                      │ 2xx                      ▲
//!                      ▼                          │ fail (original event)
//!              reply event in body? ──yes──▶ ┌─────────┐
//!                      │ no                  │  reply  │ ──▶ done
//!                      ▼                     └─────────┘
//!                    done
//! ```
//!
//! Each hop builds its request, resolves its client from the pool and runs
//! under the call's retry policy. The dead-letter sink always receives the
//! original event, annotated with what went wrong on the hop that failed.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use herald_core::{read_encoding, read_event, Addressable, Encoding, Event, MessageEncoding};
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};
use url::Url;

use crate::{
    error::DispatchError,
    reporter::{report, MetricTag, StatsReporter},
    request::{
        build_request, dispatch_execution_info_transformers, pass_through_headers,
        sanitize_addressable, Hop, Transformers, DEFAULT_FILTER_HOST, NAMESPACE_HEADER,
    },
    retry::{cancellable, send_with_retries, RetryConfig},
    ClientPool,
};

/// Result record of one hop.
#[derive(Debug, Clone, Default)]
pub struct DispatchInfo {
    /// Time spent sending, retries included. `None` when sending never
    /// started.
    pub duration: Option<Duration>,
    /// Final status code. `None` when nothing was sent; 500 when the
    /// transport failed.
    pub response_code: Option<StatusCode>,
    /// Response headers that are forwarded to the caller.
    pub response_headers: HeaderMap,
    /// Response body, captured on failure only.
    pub response_body: Bytes,
}

/// A failed dispatch together with the record of the hop that ended it.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct DispatchFailure {
    /// Record of the last hop attempted.
    pub info: DispatchInfo,
    /// What went wrong.
    pub error: DispatchError,
}

impl DispatchFailure {
    fn new(info: DispatchInfo, error: DispatchError) -> Self {
        Self { info, error }
    }
}

/// Optional behavior of a single dispatch. Absent options are no-ops.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Where to forward an event the destination answers with.
    pub reply: Option<Addressable>,
    /// Where to send the original event when a hop fails.
    pub dead_letter_sink: Option<Addressable>,
    /// Extra request headers for the destination and dead-letter hops.
    pub headers: HeaderMap,
    /// Retry policy applied to every hop. `None` means a single attempt.
    pub retry_config: Option<RetryConfig>,
    /// Outbound encoding.
    pub encoding: Encoding,
    /// Producer identity reported to the stats reporter.
    pub metric_tag: Option<MetricTag>,
    /// Aborts in-flight sends and backoff waits.
    pub cancellation: Option<CancellationToken>,
}

impl DispatchOptions {
    /// Starts building options.
    pub fn builder() -> DispatchOptionsBuilder {
        DispatchOptionsBuilder::default()
    }
}

/// Builder for [`DispatchOptions`].
#[derive(Debug, Default)]
pub struct DispatchOptionsBuilder {
    options: DispatchOptions,
    raw_headers: Vec<(String, String)>,
}

impl DispatchOptionsBuilder {
    /// Sets the reply target.
    #[must_use]
    pub fn reply(mut self, reply: Addressable) -> Self {
        self.options.reply = Some(reply);
        self
    }

    /// Sets the dead-letter sink.
    #[must_use]
    pub fn dead_letter_sink(mut self, sink: Addressable) -> Self {
        self.options.dead_letter_sink = Some(sink);
        self
    }

    /// Adds a request header. Validated at `build`.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.raw_headers.push((name.into(), value.into()));
        self
    }

    /// Adds already-validated request headers.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.options.headers.extend(headers);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.options.retry_config = Some(config);
        self
    }

    /// Sets the outbound encoding.
    #[must_use]
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.options.encoding = encoding;
        self
    }

    /// Sets the producer identity for metrics.
    #[must_use]
    pub fn metric_tag(mut self, tag: MetricTag) -> Self {
        self.options.metric_tag = Some(tag);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.options.cancellation = Some(token);
        self
    }

    /// Validates and builds the options.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` for an invalid header or a
    /// reply or dead-letter addressable without a URL.
    pub fn build(self) -> Result<DispatchOptions, DispatchError> {
        let mut options = self.options;

        for (name, value) in self.raw_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DispatchError::configuration(format!("invalid header name {name:?}: {e}")))?;
            let header_value = HeaderValue::from_str(&value).map_err(|e| {
                DispatchError::configuration(format!("invalid value for header {name:?}: {e}"))
            })?;
            options.headers.append(header_name, header_value);
        }

        if options.reply.as_ref().is_some_and(|reply| reply.url.is_none()) {
            return Err(DispatchError::configuration("reply addressable has no URL"));
        }
        if options.dead_letter_sink.as_ref().is_some_and(|sink| sink.url.is_none()) {
            return Err(DispatchError::configuration("dead-letter sink addressable has no URL"));
        }

        Ok(options)
    }
}

/// Process-wide dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Host of the filter component whose failures carry nested error
    /// context.
    pub filter_host: String,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { filter_host: DEFAULT_FILTER_HOST.to_string() }
    }
}

/// Successful hop: its record and, if the receiver answered with an event,
/// that event.
struct HopOutcome {
    info: DispatchInfo,
    reply: Option<Event>,
}

/// Dispatches events through the destination, dead-letter and reply hops.
///
/// Cheap to clone; clones share the pool and the reporter.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: Arc<ClientPool>,
    reporter: Option<Arc<dyn StatsReporter>>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    /// Creates a dispatcher sending through the given pool.
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool, reporter: None, settings: DispatcherSettings::default() }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the stats reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn StatsReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// The pool requests are sent through.
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// Dispatches an event to a destination.
    ///
    /// On success returns the record of the last successful hop: the
    /// destination's, the reply's when a reply was forwarded, or the
    /// dead-letter sink's when the event was dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchFailure`] carrying:
    /// - `MissingDestination` when the destination has no URL
    /// - `DeliveryFailed` when the destination failed and no sink is set
    /// - `DeadLetterFailed` when the destination and the sink both failed
    /// - `ReplyFailed` when forwarding the reply failed and no sink is set
    /// - `ReplyAndDeadLetterFailed` when the reply and the sink both failed
    pub async fn dispatch(
        &self,
        event: &Event,
        destination: &Addressable,
        options: DispatchOptions,
    ) -> Result<DispatchInfo, DispatchFailure> {
        let span = info_span!(
            "herald_dispatch",
            event_id = %event.id(),
            event_type = %event.ty(),
            destination = %destination,
        );

        self.run(event, destination, &options).instrument(span).await
    }

    async fn run(
        &self,
        event: &Event,
        destination: &Addressable,
        options: &DispatchOptions,
    ) -> Result<DispatchInfo, DispatchFailure> {
        if destination.url.is_none() {
            return Err(DispatchFailure::new(
                DispatchInfo::default(),
                DispatchError::MissingDestination,
            ));
        }

        let destination = sanitize_addressable(destination);
        let reply = options.reply.as_ref().map(sanitize_addressable);
        let dead_letter = options.dead_letter_sink.as_ref().map(sanitize_addressable);

        let outcome = match self
            .execute_hop(event, &destination, &options.headers, Hop::Destination, options, &Transformers::new())
            .await
        {
            Ok(outcome) => outcome,
            Err(failure) if matches!(failure.error, DispatchError::Cancelled) => return Err(failure),
            Err(failure) => {
                warn!(target_url = %destination, "delivery failed: {}", failure.error);
                let Some(dead_letter) = dead_letter else {
                    return Err(DispatchFailure::new(
                        failure.info,
                        DispatchError::DeliveryFailed {
                            target: destination.to_string(),
                            source: Box::new(failure.error),
                        },
                    ));
                };

                return self
                    .dead_letter(event, &destination, &dead_letter, &options.headers, failure, options)
                    .await
                    .map_err(|(info, hop_error, dead_letter_error)| {
                        DispatchFailure::new(
                            info,
                            DispatchError::DeadLetterFailed {
                                target: destination.to_string(),
                                error: Box::new(hop_error),
                                dead_letter: dead_letter.to_string(),
                                dead_letter_error: Box::new(dead_letter_error),
                            },
                        )
                    });
            },
        };

        let HopOutcome { mut info, reply: reply_event } = outcome;
        if let Some(namespace) = options.headers.get(NAMESPACE_HEADER) {
            info.response_headers
                .insert(HeaderName::from_static(NAMESPACE_HEADER), namespace.clone());
        }

        let Some(reply_event) = reply_event else {
            return Ok(info);
        };
        let Some(reply) = reply else {
            debug!(reply_id = %reply_event.id(), "no reply target configured, discarding reply");
            return Ok(info);
        };

        let reply_headers = info.response_headers.clone();
        match self
            .execute_hop(&reply_event, &reply, &reply_headers, Hop::Reply, options, &Transformers::new())
            .await
        {
            Ok(outcome) => Ok(outcome.info),
            Err(failure) if matches!(failure.error, DispatchError::Cancelled) => Err(failure),
            Err(failure) => {
                warn!(target_url = %reply, "reply forwarding failed: {}", failure.error);
                let Some(dead_letter) = dead_letter else {
                    return Err(DispatchFailure::new(
                        failure.info,
                        DispatchError::ReplyFailed {
                            target: reply.to_string(),
                            source: Box::new(failure.error),
                        },
                    ));
                };

                self.dead_letter(event, &reply, &dead_letter, &reply_headers, failure, options)
                    .await
                    .map_err(|(info, hop_error, dead_letter_error)| {
                        DispatchFailure::new(
                            info,
                            DispatchError::ReplyAndDeadLetterFailed {
                                target: reply.to_string(),
                                error: Box::new(hop_error),
                                dead_letter: dead_letter.to_string(),
                                dead_letter_error: Box::new(dead_letter_error),
                            },
                        )
                    })
            },
        }
    }

    /// Sends the original event to the sink, annotated with the failure of
    /// the hop to `failed_target`. On error returns the sink's record, the
    /// hop's error and the sink's error.
    async fn dead_letter(
        &self,
        event: &Event,
        failed_target: &Addressable,
        dead_letter: &Addressable,
        headers: &HeaderMap,
        failure: DispatchFailure,
        options: &DispatchOptions,
    ) -> Result<DispatchInfo, (DispatchInfo, DispatchError, DispatchError)> {
        let transformers = dispatch_execution_info_transformers(
            failed_target.url.as_ref(),
            &failure.info,
            &self.settings.filter_host,
        );

        match self
            .execute_hop(event, dead_letter, headers, Hop::DeadLetter, options, &transformers)
            .await
        {
            Ok(outcome) => {
                debug!(target_url = %dead_letter, "event dead-lettered");
                Ok(outcome.info)
            },
            Err(sink_failure) => {
                error!(
                    target_url = %dead_letter,
                    failed_url = %failed_target,
                    "dead-letter sink failed: {}",
                    sink_failure.error
                );
                Err((sink_failure.info, failure.error, sink_failure.error))
            },
        }
    }

    /// Runs one hop: build, send with retries, classify the response.
    async fn execute_hop(
        &self,
        event: &Event,
        target: &Addressable,
        headers: &HeaderMap,
        hop: Hop,
        options: &DispatchOptions,
        transformers: &Transformers,
    ) -> Result<HopOutcome, DispatchFailure> {
        let mut info = DispatchInfo::default();
        let target_url = target.url.as_ref().map_or_else(String::new, Url::to_string);

        let request = build_request(event, target, headers, hop, options.encoding, transformers)
            .map_err(|error| DispatchFailure::new(info.clone(), error))?;

        let start = Instant::now();
        let result = send_with_retries(
            &self.pool,
            target,
            request,
            options.retry_config.as_ref(),
            options.cancellation.as_ref(),
        )
        .await;
        info.duration = Some(start.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                if matches!(error, DispatchError::Transport { .. } | DispatchError::Timeout { .. }) {
                    info.response_code = Some(StatusCode::INTERNAL_SERVER_ERROR);
                    info.response_body = Bytes::from(format!("dispatch error: {error}"));
                }
                return Err(DispatchFailure::new(info, error));
            },
        };

        let status = response.status();
        info.response_code = Some(status);
        info.response_headers = pass_through_headers(response.headers());
        report(
            self.reporter.as_deref(),
            options.metric_tag.as_ref(),
            event.source(),
            event.ty(),
            status,
        );
        debug!(%hop, target_url = %target_url, status = status.as_u16(), "hop answered");

        let response_headers = response.headers().clone();
        let body = cancellable(options.cancellation.as_ref(), response.bytes())
            .await
            .map_err(|error| DispatchFailure::new(info.clone(), error))?;

        if !status.is_success() {
            info.response_body = match body {
                Ok(body) => body,
                Err(e) => Bytes::from(format!(
                    "dispatch resulted in status \"{status}\". Could not read response body: error: {e}"
                )),
            };
            return Err(DispatchFailure::new(
                info,
                DispatchError::unexpected_status(target_url, status.as_u16()),
            ));
        }

        let reply = match body {
            Ok(body) => decode_reply(&response_headers, body),
            Err(e) => {
                debug!(target_url = %target_url, "could not read response body, ignoring reply: {e}");
                None
            },
        };

        Ok(HopOutcome { info, reply })
    }
}

/// Reads a reply event from a successful response. Anything that is not a
/// single well-formed event is no reply.
fn decode_reply(headers: &HeaderMap, body: Bytes) -> Option<Event> {
    match read_encoding(headers) {
        MessageEncoding::Unknown => return None,
        MessageEncoding::Batch => {
            debug!("response carries an event batch, ignoring it");
            return None;
        },
        MessageEncoding::Binary | MessageEncoding::Structured => {},
    }

    match read_event(headers, body) {
        Ok(reply) => reply,
        Err(e) => {
            debug!("response body is not a valid event, ignoring it: {e}");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn event() -> Event {
        Event::builder()
            .id("evt-1")
            .source("/tests/dispatcher")
            .ty("dev.herald.test")
            .json_data(&serde_json::json!({"n": 1}))
            .build()
            .unwrap()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(ClientPool::new()))
    }

    #[test]
    fn builder_validates_headers() {
        let result = DispatchOptions::builder().header("bad header", "x").build();
        assert!(matches!(result, Err(DispatchError::Configuration { .. })));

        let result = DispatchOptions::builder().header("x-ok", "line\nbreak").build();
        assert!(matches!(result, Err(DispatchError::Configuration { .. })));

        let options = DispatchOptions::builder().header("x-ok", "1").build().unwrap();
        assert_eq!(options.headers["x-ok"], "1");
    }

    #[test]
    fn builder_rejects_addressables_without_url() {
        let result = DispatchOptions::builder().reply(Addressable::default()).build();
        assert!(matches!(result, Err(DispatchError::Configuration { .. })));

        let result = DispatchOptions::builder().dead_letter_sink(Addressable::default()).build();
        assert!(matches!(result, Err(DispatchError::Configuration { .. })));
    }

    #[test]
    fn decode_reply_ignores_non_events() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        assert!(decode_reply(&headers, Bytes::from("{}")).is_none());

        headers.insert("content-type", HeaderValue::from_static("application/cloudevents+json"));
        assert!(decode_reply(&headers, Bytes::from("not json")).is_none());
    }

    #[tokio::test]
    async fn missing_destination_fails_before_io() {
        let failure = dispatcher()
            .dispatch(&event(), &Addressable::default(), DispatchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, DispatchError::MissingDestination));
        assert!(failure.info.duration.is_none());
        assert!(failure.info.response_code.is_none());
    }

    #[tokio::test]
    async fn plain_success_records_status() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("prefer", "reply"))
            .and(matchers::header("ce-id", "evt-1"))
            .respond_with(ResponseTemplate::new(202).insert_header("x-request-id", "abc"))
            .expect(1)
            .mount(&server)
            .await;

        let destination = Addressable::parse(&server.uri()).unwrap();
        let info = dispatcher()
            .dispatch(&event(), &destination, DispatchOptions::default())
            .await
            .unwrap();

        assert_eq!(info.response_code, Some(StatusCode::ACCEPTED));
        assert!(info.duration.is_some());
        assert!(info.response_body.is_empty());
        assert_eq!(info.response_headers["x-request-id"], "abc");
    }

    #[tokio::test]
    async fn failure_body_captured() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad event"))
            .mount(&server)
            .await;

        let destination = Addressable::parse(&server.uri()).unwrap();
        let failure = dispatcher()
            .dispatch(&event(), &destination, DispatchOptions::default())
            .await
            .unwrap_err();

        assert_eq!(failure.info.response_code, Some(StatusCode::BAD_REQUEST));
        assert_eq!(failure.info.response_body, Bytes::from("bad event"));
        match failure.error {
            DispatchError::DeliveryFailed { source, .. } => {
                assert!(matches!(*source, DispatchError::UnexpectedStatus { status: 400, .. }));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn namespace_header_propagated_to_response() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header(NAMESPACE_HEADER, "team-a"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let destination = Addressable::parse(&server.uri()).unwrap();
        let options = DispatchOptions::builder().header("Kn-Namespace", "team-a").build().unwrap();
        let info = dispatcher().dispatch(&event(), &destination, options).await.unwrap();

        assert_eq!(info.response_headers[NAMESPACE_HEADER], "team-a");
    }

    #[tokio::test]
    async fn cancellation_aborts_dispatch() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let token = CancellationToken::new();
        token.cancel();

        let destination = Addressable::parse(&server.uri()).unwrap();
        let options = DispatchOptions::builder().cancellation(token).build().unwrap();
        let failure = dispatcher().dispatch(&event(), &destination, options).await.unwrap_err();

        assert!(matches!(failure.error, DispatchError::Cancelled));
    }
}
