//! Standalone event sending for event sources.
//!
//! [`HttpEventSender`] sends one event to one target through the shared
//! [`ClientPool`] and the retry engine, without the reply and dead-letter
//! legs of the dispatcher. Sources that emit events on their own schedule
//! hold one sender and reuse it for every event.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::{Addressable, Encoding, Event, ExtensionValue};
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::{
    error::{DispatchError, Result},
    pool::ClientPool,
    reporter::{report, MetricTag, StatsReporter},
    request::{build_request, Hop, Transformers},
    retry::{self, cancellable, RetryConfig},
};

/// Adjustment applied to every request a sender makes.
#[derive(Debug, Clone)]
pub enum RequestOption {
    /// Sets a header, replacing any value the request already carries.
    Header {
        /// Header name.
        name: HeaderName,
        /// Header value.
        value: HeaderValue,
    },
    /// Sets extension attributes on every sent event, overwriting existing
    /// values.
    ExtensionOverrides(BTreeMap<String, ExtensionValue>),
}

impl RequestOption {
    /// Parses a header option.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the name or value is not
    /// a valid header.
    pub fn header(name: &str, value: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DispatchError::configuration(format!("invalid header name {name:?}: {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| DispatchError::configuration(format!("invalid value for header {name}: {e}")))?;
        Ok(Self::Header { name: header_name, value: header_value })
    }
}

/// One event addressed to one target.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Event to send.
    pub event: Event,
    /// Receiver of the event.
    pub target: Addressable,
    /// Extra request headers.
    pub headers: HeaderMap,
    /// Wire encoding of the event.
    pub encoding: Encoding,
    /// Producer identity for metrics. Untagged sends are not reported.
    pub metric_tag: Option<MetricTag>,
}

impl SendRequest {
    /// Creates a binary-mode request without extra headers.
    pub fn new(event: Event, target: Addressable) -> Self {
        Self {
            event,
            target,
            headers: HeaderMap::new(),
            encoding: Encoding::default(),
            metric_tag: None,
        }
    }

    /// Sets the wire encoding.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Tags the send for metrics.
    pub fn with_metric_tag(mut self, tag: MetricTag) -> Self {
        self.metric_tag = Some(tag);
        self
    }
}

/// A receiver's answer, with the body already read.
#[derive(Debug, Clone)]
pub struct SendResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl SendResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Sends events to receivers.
///
/// Any status is a successful send; callers inspect
/// [`SendResponse::status`] themselves.
#[async_trait]
pub trait EventSender: Send + Sync + std::fmt::Debug {
    /// Sends the event once.
    async fn send(&self, request: SendRequest) -> Result<SendResponse>;

    /// Sends the event, retrying per `config`. `None` sends once.
    async fn send_with_retries(
        &self,
        request: SendRequest,
        config: Option<&RetryConfig>,
    ) -> Result<SendResponse>;
}

/// [`EventSender`] backed by the connection pool.
#[derive(Debug, Clone)]
pub struct HttpEventSender {
    pool: Arc<ClientPool>,
    timeout: Option<Duration>,
    reporter: Option<Arc<dyn StatsReporter>>,
    options: Vec<RequestOption>,
    cancellation: Option<CancellationToken>,
}

impl HttpEventSender {
    /// Creates a sender without timeout, reporter or request options.
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool, timeout: None, reporter: None, options: Vec::new(), cancellation: None }
    }

    /// Bounds each attempt. A retry config's own request timeout takes
    /// precedence. Zero clears the bound.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
    }

    /// Reports every answered send to `reporter`.
    pub fn set_stats_reporter(&mut self, reporter: Arc<dyn StatsReporter>) {
        self.reporter = Some(reporter);
    }

    /// Appends request options. Options apply in insertion order.
    pub fn add_request_options(&mut self, options: impl IntoIterator<Item = RequestOption>) {
        self.options.extend(options);
    }

    /// Aborts in-flight sends and retry waits when `token` fires.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = Some(token);
    }

    /// The pool this sender draws clients from.
    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    fn prepare(&self, mut request: SendRequest) -> Result<(SendRequest, reqwest::Request)> {
        let target_url = request.target.to_string();

        for option in &self.options {
            match option {
                RequestOption::Header { name, value } => {
                    request.headers.insert(name.clone(), value.clone());
                },
                RequestOption::ExtensionOverrides(overrides) => {
                    for (name, value) in overrides {
                        request.event = request
                            .event
                            .with_extension(name, value.clone())
                            .map_err(|e| DispatchError::encoding(&target_url, e.to_string()))?;
                    }
                },
            }
        }

        let mut http_request = build_request(
            &request.event,
            &request.target,
            &request.headers,
            Hop::Direct,
            request.encoding,
            &Transformers::new(),
        )?;
        if let Some(timeout) = self.timeout {
            *http_request.timeout_mut() = Some(timeout);
        }
        Ok((request, http_request))
    }
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send(&self, request: SendRequest) -> Result<SendResponse> {
        self.send_with_retries(request, None).await
    }

    async fn send_with_retries(
        &self,
        request: SendRequest,
        config: Option<&RetryConfig>,
    ) -> Result<SendResponse> {
        let span = info_span!(
            "herald_source_send",
            event_id = %request.event.id(),
            event_type = %request.event.ty(),
            target = %request.target,
        );

        async move {
            let (request, http_request) = self.prepare(request)?;
            let cancellation = self.cancellation.as_ref();

            let response =
                retry::send_with_retries(&self.pool, &request.target, http_request, config, cancellation)
                    .await?;

            let status = response.status();
            let headers = response.headers().clone();
            report(
                self.reporter.as_deref(),
                request.metric_tag.as_ref(),
                request.event.source(),
                request.event.ty(),
                status,
            );

            let body = cancellable(cancellation, response.bytes())
                .await?
                .map_err(|e| DispatchError::from_reqwest(&request.target.to_string(), &e))?;
            debug!(status = status.as_u16(), "event sent");

            Ok(SendResponse { status, headers, body })
        }
        .instrument(span)
        .await
    }
}
