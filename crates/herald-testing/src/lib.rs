//! Test infrastructure for herald.
//!
//! Provides recording HTTP receivers, event fixtures, and a recording stats
//! reporter for the dispatch core's metrics seam.

pub mod fixtures;
pub mod http;
pub mod reporter;

pub use http::{ReceiverResponse, ReceiverServer, RecordedRequest};
pub use reporter::RecordingStatsReporter;
use tracing_subscriber::EnvFilter;

/// Initializes test logging once per process. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,herald=debug")),
        )
        .with_test_writer()
        .try_init();
}
