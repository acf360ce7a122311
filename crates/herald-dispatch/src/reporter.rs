//! Metrics hook for delivered events.
//!
//! The dispatch core does not export metrics itself. It reports one count
//! per successful send to a [`StatsReporter`] supplied by the host process,
//! tagged with the producer identity from the call's [`MetricTag`]. Calls
//! without a reporter or without a tag report nothing.

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Identity of the producer a dispatch is made on behalf of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTag {
    /// Name of the producing resource.
    pub name: String,
    /// Namespace of the producing resource.
    pub namespace: String,
    /// Resource group of the producing resource.
    pub resource_group: String,
}

/// Dimensions of one reported event count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArgs {
    /// Namespace of the producer.
    pub namespace: String,
    /// `source` attribute of the sent event.
    pub event_source: String,
    /// `type` attribute of the sent event.
    pub event_type: String,
    /// Name of the producer.
    pub name: String,
    /// Resource group of the producer.
    pub resource_group: String,
}

impl ReportArgs {
    /// Combines a producer tag with the sent event's identity.
    pub fn new(tag: &MetricTag, event_source: &str, event_type: &str) -> Self {
        Self {
            namespace: tag.namespace.clone(),
            event_source: event_source.to_string(),
            event_type: event_type.to_string(),
            name: tag.name.clone(),
            resource_group: tag.resource_group.clone(),
        }
    }
}

/// Receives event counts from the dispatch core.
///
/// Implementations must be cheap and must not block; they run inline on
/// the dispatch path.
pub trait StatsReporter: Send + Sync + std::fmt::Debug {
    /// Counts one event answered with `status`.
    fn report_event_count(&self, args: &ReportArgs, status: StatusCode);
}

/// Reporter that discards every count.
#[derive(Debug, Default)]
pub struct NoOpStatsReporter;

impl StatsReporter for NoOpStatsReporter {
    fn report_event_count(&self, _args: &ReportArgs, _status: StatusCode) {}
}

/// Reports a successful send. No reporter or no tag means no report.
pub(crate) fn report(
    reporter: Option<&dyn StatsReporter>,
    tag: Option<&MetricTag>,
    event_source: &str,
    event_type: &str,
    status: StatusCode,
) {
    if let (Some(reporter), Some(tag)) = (reporter, tag) {
        reporter.report_event_count(&ReportArgs::new(tag, event_source, event_type), status);
    }
}
