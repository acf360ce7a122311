//! Dispatch core: pooled HTTP delivery of events.
//!
//! A [`Dispatcher`] sends an event to a destination through a shared
//! [`ClientPool`], retrying per a [`RetryConfig`]. A failed delivery goes
//! to the dead-letter sink annotated with the failure; a reply event from
//! the destination is forwarded to the reply target. Event sources that
//! need none of that use [`HttpEventSender`] directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod reporter;
pub mod request;
pub mod retry;

pub use client::{EventSender, HttpEventSender, RequestOption, SendRequest, SendResponse};
pub use config::DispatchConfig;
pub use dispatcher::{
    DispatchFailure, DispatchInfo, DispatchOptions, DispatchOptionsBuilder, Dispatcher,
    DispatcherSettings,
};
pub use error::{DispatchError, ErrorCategory, Result};
pub use pool::{ClientPool, ConnectionArgs, PooledClient};
pub use reporter::{MetricTag, NoOpStatsReporter, ReportArgs, StatsReporter};
pub use request::{Hop, Transformer, Transformers};
pub use retry::{
    Backoff, BackoffPolicy, BackoffStrategy, ConstantBackoff, DeliverySpec, ExponentialJitter,
    NoRetry, PolicyBackoff, RetryConfig, RetryIfGreaterThan300, RetryPredicate, SelectiveRetry,
};
