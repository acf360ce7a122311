//! Recording stats reporter.

use std::sync::Mutex;

use herald_dispatch::{ReportArgs, StatsReporter};
use http::StatusCode;

/// [`StatsReporter`] that keeps every reported count.
#[derive(Debug, Default)]
pub struct RecordingStatsReporter {
    reports: Mutex<Vec<(ReportArgs, StatusCode)>>,
}

impl RecordingStatsReporter {
    /// Creates an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports received so far, in order.
    pub fn reports(&self) -> Vec<(ReportArgs, StatusCode)> {
        self.lock().clone()
    }

    /// Number of reports received.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ReportArgs, StatusCode)>> {
        self.reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StatsReporter for RecordingStatsReporter {
    fn report_event_count(&self, args: &ReportArgs, status: StatusCode) {
        self.lock().push((args.clone(), status));
    }
}
