//! Bounded retries with pluggable backoff and server-directed delays.
//!
//! A [`RetryConfig`] decides whether an attempt is retried (its predicate)
//! and how long to wait first (its backoff). On 429 and 503 responses the
//! `Retry-After` header can stretch the wait; that is opt-in through
//! `retry_after_max_duration`:
//!
//! | `retry_after_max_duration` | `Retry-After` on 429/503 |
//! |----------------------------|--------------------------|
//! | `None`                     | ignored                  |
//! | `Some(0)`                  | ignored                  |
//! | `Some(max)`                | honored, clamped to max  |
//!
//! The wait before a retry is the larger of the backoff and the
//! `Retry-After` delay.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveDateTime, Utc};
use herald_core::Addressable;
use http::{header::RETRY_AFTER, HeaderMap, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{DispatchError, Result},
    pool::ClientPool,
};

/// Status and headers of a response, as seen by predicates and backoffs.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: &'a HeaderMap,
}

impl<'a> From<&'a reqwest::Response> for ResponseView<'a> {
    fn from(response: &'a reqwest::Response) -> Self {
        Self { status: response.status(), headers: response.headers() }
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy)]
pub enum Attempt<'a> {
    /// The receiver answered, with any status.
    Response(ResponseView<'a>),
    /// No response: transport failure or timeout.
    Error(&'a DispatchError),
}

/// Decides whether an attempt should be retried.
pub trait RetryPredicate: Send + Sync {
    /// Returns true when the attempt should be retried.
    fn should_retry(&self, attempt: &Attempt<'_>) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&Attempt<'_>) -> bool + Send + Sync,
{
    fn should_retry(&self, attempt: &Attempt<'_>) -> bool {
        self(attempt)
    }
}

/// Computes the wait before a retry.
///
/// `retry` is the zero-based index of the retry about to happen; `response`
/// is the response of the attempt that just failed, if there was one.
pub trait Backoff: Send + Sync {
    /// Returns the wait before the retry.
    fn delay(&self, retry: u32, response: Option<&ResponseView<'_>>) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32, Option<&ResponseView<'_>>) -> Duration + Send + Sync,
{
    fn delay(&self, retry: u32, response: Option<&ResponseView<'_>>) -> Duration {
        self(retry, response)
    }
}

/// Waits the same amount before every retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _retry: u32, _response: Option<&ResponseView<'_>>) -> Duration {
        self.0
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPredicate for NoRetry {
    fn should_retry(&self, _attempt: &Attempt<'_>) -> bool {
        false
    }
}

/// Retries transport failures and any status of 300 or above.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryIfGreaterThan300;

impl RetryPredicate for RetryIfGreaterThan300 {
    fn should_retry(&self, attempt: &Attempt<'_>) -> bool {
        match attempt {
            Attempt::Response(response) => response.status.as_u16() >= 300,
            Attempt::Error(_) => true,
        }
    }
}

/// Retries transport failures and the statuses that usually clear up on
/// their own: 404, 408, 409, 429 and 5xx.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectiveRetry;

impl RetryPredicate for SelectiveRetry {
    fn should_retry(&self, attempt: &Attempt<'_>) -> bool {
        match attempt {
            Attempt::Response(response) => {
                matches!(response.status.as_u16(), 404 | 408 | 409 | 429 | 500..=599)
            },
            Attempt::Error(_) => true,
        }
    }
}

/// Backoff policy of a delivery spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// `delay * retry`
    Linear,
    /// `delay * 2^retry`
    Exponential,
}

/// Deterministic backoff following a [`BackoffPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyBackoff {
    /// Growth policy.
    pub policy: BackoffPolicy,
    /// Base delay.
    pub delay: Duration,
}

impl Backoff for PolicyBackoff {
    fn delay(&self, retry: u32, _response: Option<&ResponseView<'_>>) -> Duration {
        match self.policy {
            BackoffPolicy::Linear => self.delay.saturating_mul(retry),
            BackoffPolicy::Exponential => {
                self.delay.saturating_mul(2_u32.saturating_pow(retry.min(31)))
            },
        }
    }
}

/// Strategy for calculating jittered retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each retry.
    Exponential,
    /// Linear backoff: delay increases by the base amount each retry.
    Linear,
}

/// Capped backoff with random jitter, for spreading retries of many
/// producers hitting the same receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialJitter {
    /// Base delay.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Jitter percentage (0.0 to 1.0).
    pub jitter_factor: f64,
    /// Growth strategy.
    pub strategy: BackoffStrategy,
}

impl Default for ExponentialJitter {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.25,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl Backoff for ExponentialJitter {
    fn delay(&self, retry: u32, _response: Option<&ResponseView<'_>>) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                self.base_delay.saturating_mul(2_u32.saturating_pow(retry.min(20)))
            },
        };

        let capped = base.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor`. With 0.25, 10s becomes 7.5s to
/// 12.5s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::try_from_secs_f64(jittered_secs.max(0.0)).unwrap_or(duration)
}

/// Delivery settings of a subscription or sink, as configured by users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySpec {
    /// Number of retries after the first attempt.
    pub retry: Option<u32>,
    /// Backoff growth policy. Ignored without `backoff_delay`.
    pub backoff_policy: Option<BackoffPolicy>,
    /// Base backoff delay. Ignored without `backoff_policy`.
    pub backoff_delay: Option<Duration>,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Ceiling for `Retry-After` delays; absent disables them.
    pub retry_after_max: Option<Duration>,
}

/// Per-call retry policy.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub retry_max: u32,
    /// Decides whether an attempt is retried.
    pub check_retry: Arc<dyn RetryPredicate>,
    /// Computes the wait before each retry.
    pub backoff: Arc<dyn Backoff>,
    /// Timeout of each attempt, overriding the client's.
    pub request_timeout: Option<Duration>,
    /// Ceiling for `Retry-After` delays on 429/503.
    pub retry_after_max_duration: Option<Duration>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("retry_max", &self.retry_max)
            .field("request_timeout", &self.request_timeout)
            .field("retry_after_max_duration", &self.retry_after_max_duration)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::no_retries()
    }
}

impl RetryConfig {
    /// One attempt, never retried, no backoff.
    pub fn no_retries() -> Self {
        Self {
            retry_max: 0,
            check_retry: Arc::new(NoRetry),
            backoff: Arc::new(ConstantBackoff(Duration::ZERO)),
            request_timeout: None,
            retry_after_max_duration: None,
        }
    }

    /// Retries up to `retry_max` times whatever [`RetryIfGreaterThan300`]
    /// accepts, without waiting in between.
    pub fn new(retry_max: u32) -> Self {
        Self { retry_max, check_retry: Arc::new(RetryIfGreaterThan300), ..Self::no_retries() }
    }

    /// Builds the policy described by a delivery spec.
    pub fn from_delivery_spec(spec: &DeliverySpec) -> Self {
        let mut config = Self::new(spec.retry.unwrap_or(0));

        if let (Some(policy), Some(delay)) = (spec.backoff_policy, spec.backoff_delay) {
            config.backoff = Arc::new(PolicyBackoff { policy, delay });
        }
        config.request_timeout = spec.timeout;
        config.retry_after_max_duration = spec.retry_after_max;
        config
    }

    /// Replaces the retry predicate.
    #[must_use]
    pub fn with_predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.check_retry = Arc::new(predicate);
        self
    }

    /// Replaces the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the `Retry-After` ceiling.
    #[must_use]
    pub fn with_retry_after_max(mut self, max: Duration) -> Self {
        self.retry_after_max_duration = Some(max);
        self
    }
}

/// Computes the wait before retry `retry` given the failed attempt's
/// response.
pub fn backoff_delay(config: &RetryConfig, retry: u32, response: Option<&ResponseView<'_>>) -> Duration {
    let mut retry_after = Duration::ZERO;
    if let (Some(max), Some(response)) = (config.retry_after_max_duration, response) {
        if matches!(response.status, StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE) {
            retry_after = parse_retry_after(response.headers).min(max);
        }
    }

    let backoff = config.backoff.delay(retry, response);
    retry_after.max(backoff)
}

/// Reads the `Retry-After` header as a delay from now. Absent or unparsable
/// values yield zero.
pub fn parse_retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map_or(Duration::ZERO, |value| parse_retry_after_at(value, Utc::now()))
}

/// Parses a `Retry-After` value relative to `now`.
///
/// Accepts delay-seconds and the three HTTP-date formats: IMF-fixdate,
/// RFC 850 and asctime. Dates in the past yield zero.
pub fn parse_retry_after_at(value: &str, now: DateTime<Utc>) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds).map_or(Duration::ZERO, Duration::from_secs);
    }

    match parse_http_date(value) {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        None => {
            debug!(value, "failed to parse Retry-After header");
            Duration::ZERO
        },
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }

    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&normalized, format).ok())
        .map(|naive| naive.and_utc())
}

/// Runs a future unless the token fires first.
pub(crate) async fn cancellable<F: Future>(
    cancellation: Option<&CancellationToken>,
    future: F,
) -> Result<F::Output> {
    match cancellation {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => Err(DispatchError::Cancelled),
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}

/// Sends a request, retrying per `config`.
///
/// The client is resolved through the pool on every attempt, so an
/// eviction or replacement between attempts takes effect immediately.
/// Without a config exactly one attempt is made. After the last attempt its
/// response (of any status) or error is returned as-is; responses of
/// retried attempts are drained and dropped.
///
/// # Errors
///
/// Returns the pool's error if no client can be resolved, the mapped
/// transport error of the last attempt, or `DispatchError::Cancelled`.
pub async fn send_with_retries(
    pool: &ClientPool,
    target: &Addressable,
    request: reqwest::Request,
    config: Option<&RetryConfig>,
    cancellation: Option<&CancellationToken>,
) -> Result<reqwest::Response> {
    let url = request.url().to_string();
    let mut retry = 0_u32;

    loop {
        let client = pool.client_for(target).await?;
        let mut attempt = request.try_clone().ok_or_else(|| {
            DispatchError::configuration(format!("request to {url} has a streaming body"))
        })?;
        if let Some(timeout) = config.and_then(|c| c.request_timeout) {
            *attempt.timeout_mut() = Some(timeout);
        }

        let outcome = cancellable(cancellation, client.execute(attempt))
            .await?
            .map_err(|e| DispatchError::from_reqwest(&url, &e));

        let Some(config) = config else {
            return outcome;
        };

        let (should_retry, wait) = {
            let (view, attempt) = match &outcome {
                Ok(response) => {
                    let view = ResponseView::from(response);
                    (Some(view), Attempt::Response(view))
                },
                Err(error) => (None, Attempt::Error(error)),
            };
            let should_retry = retry < config.retry_max && config.check_retry.should_retry(&attempt);
            let wait = if should_retry { backoff_delay(config, retry, view.as_ref()) } else { Duration::ZERO };
            (should_retry, wait)
        };

        if !should_retry {
            return outcome;
        }

        match outcome {
            Ok(response) => {
                debug!(url = %url, status = response.status().as_u16(), retry, ?wait, "retrying request");
                // Drain so the connection can go back to the pool.
                let _ = cancellable(cancellation, response.bytes()).await?;
            },
            Err(error) => debug!(url = %url, retry, ?wait, "retrying request after error: {error}"),
        }

        cancellable(cancellation, tokio::time::sleep(wait)).await?;
        retry += 1;
    }
}
