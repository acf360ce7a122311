//! Recording HTTP receivers for dispatch tests.

use std::time::Duration;

use bytes::Bytes;
use herald_core::{read_event, write_message, Addressable, Encoding, Event};
use http::{HeaderMap, Method};
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Mock event receiver on a random local port.
///
/// Every request is recorded. Paths without a mounted response answer
/// 404.
pub struct ReceiverServer {
    server: MockServer,
}

impl ReceiverServer {
    /// Starts a new receiver.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Base URL of the receiver.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// URL of `path` on this receiver.
    pub fn url_for(&self, path: &str) -> Url {
        let base = Url::parse(&self.server.uri()).expect("mock server uri is a valid url");
        base.join(path).expect("path joins onto mock server uri")
    }

    /// Addressable pointing at `path` on this receiver.
    pub fn addressable(&self, path: &str) -> Addressable {
        Addressable::new(self.url_for(path))
    }

    /// Answers every POST to `path` with `response`.
    pub async fn respond(&self, at: &str, response: ReceiverResponse) {
        Mock::given(method("POST"))
            .and(path(at))
            .respond_with(response.template())
            .mount(&self.server)
            .await;
    }

    /// Answers the next `times` POSTs to `path` with `response`.
    ///
    /// Responses mounted earlier take precedence, so mounting a limited
    /// failure before a permanent success scripts "fail then succeed".
    pub async fn respond_times(&self, at: &str, response: ReceiverResponse, times: u64) {
        Mock::given(method("POST"))
            .and(path(at))
            .respond_with(response.template())
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// All requests received so far, in arrival order.
    pub async fn received(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| RecordedRequest {
                path: request.url.path().to_string(),
                method: request.method,
                headers: request.headers,
                body: Bytes::from(request.body),
            })
            .collect()
    }

    /// Requests received on `path`.
    pub async fn received_on(&self, at: &str) -> Vec<RecordedRequest> {
        self.received().await.into_iter().filter(|request| request.path == at).collect()
    }

    /// Events decoded from the requests received on `path`.
    ///
    /// # Panics
    ///
    /// Panics if a request does not carry a valid event.
    pub async fn received_events(&self, at: &str) -> Vec<Event> {
        self.received_on(at).await.iter().map(RecordedRequest::event).collect()
    }

    /// Asserts that exactly `expected` requests arrived on `path`.
    pub async fn assert_request_count(&self, at: &str, expected: usize) {
        let received = self.received_on(at).await.len();
        assert_eq!(received, expected, "expected {expected} requests on {at}, received {received}");
    }
}

/// A canned receiver answer.
#[derive(Debug, Clone)]
pub struct ReceiverResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
    delay: Option<Duration>,
}

impl ReceiverResponse {
    /// Empty response with the given status.
    pub fn status(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Bytes::new(), delay: None }
    }

    /// Empty `202 Accepted`.
    pub fn accepted() -> Self {
        Self::status(202)
    }

    /// `200 OK` carrying `event` as a reply.
    pub fn reply(event: &Event, encoding: Encoding) -> Self {
        let message = write_message(event, encoding).expect("fixture event encodes");
        let mut response = Self::status(200).with_body(message.body);
        for (name, value) in &message.headers {
            let value = value.to_str().expect("encoded headers are visible ascii");
            response = response.with_header(name.as_str(), value);
        }
        response
    }

    /// Adds a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the response body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Adds a `Retry-After` header.
    #[must_use]
    pub fn with_retry_after(self, value: impl Into<String>) -> Self {
        self.with_header("retry-after", value)
    }

    /// Delays the response.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn template(&self) -> ResponseTemplate {
        let mut template = ResponseTemplate::new(self.status).set_body_bytes(self.body.to_vec());
        for (name, value) in &self.headers {
            template = template.insert_header(name.as_str(), value.as_str());
        }
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

/// A request as the receiver saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Decodes the event carried by this request.
    ///
    /// # Panics
    ///
    /// Panics if the request carries no valid event.
    pub fn event(&self) -> Event {
        read_event(&self.headers, self.body.clone())
            .expect("request carries a decodable event")
            .expect("request carries an event")
    }

    /// Value of a header as a string, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}
