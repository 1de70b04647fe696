//! Shared handler state.

use std::sync::Arc;
use std::time::Instant;

use cmdlink_commands::{CommandDispatcher, DedupCache, PollReconciler};
use cmdlink_transport::Transport;

/// State for the trigger process (`serve`).
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub dedup: Arc<DedupCache>,
    /// Absent in dispatch-only mode.
    pub reconciler: Option<Arc<PollReconciler>>,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        dedup: Arc<DedupCache>,
        reconciler: Option<Arc<PollReconciler>>,
    ) -> Self {
        Self {
            dispatcher,
            dedup,
            reconciler,
            started_at: Instant::now(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.dispatcher.transport()
    }
}

/// State for the status consumer process (`consume`).
#[derive(Clone)]
pub struct ConsumerState {
    pub transport: Arc<dyn Transport>,
    pub started_at: Instant,
}

impl ConsumerState {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            started_at: Instant::now(),
        }
    }
}
