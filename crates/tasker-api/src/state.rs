//! Shared application state.

use statement_tasker::{InvocationRouter, TrackingStore};

/// State passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub router: InvocationRouter,

    pub store: TrackingStore,

    /// Server start time for uptime reporting
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(router: InvocationRouter, store: TrackingStore) -> Self {
        Self {
            router,
            store,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
