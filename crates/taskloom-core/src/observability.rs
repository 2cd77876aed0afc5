//! Logging setup and status views.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Filter comes from `RUST_LOG`
/// (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Snapshot of a queue, by task location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Ready to be pulled.
    pub pending: usize,
    /// Waiting for `process_at` (delayed or backing off).
    pub scheduled: usize,
    /// Pulled and not yet acked, requeued or archived.
    pub in_flight: usize,
    pub archived: usize,
}

impl QueueCounts {
    /// Tasks still owed processing.
    pub fn live(&self) -> usize {
        self.pending + self.scheduled + self.in_flight
    }
}
