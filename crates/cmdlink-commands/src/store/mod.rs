//! Access to the command record held by the item store.
//!
//! Two narrow views over the same store: the reconciler reads pending work
//! and can only fail commands it cannot route; the status consumer is the
//! only component that writes device-reported outcomes.

mod item_store;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::command::{Command, CommandId, CommandUpdate};

pub use item_store::ItemStoreClient;
pub use memory::{MemoryCommandStore, StoreMutation};

/// Item store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication rejected by item store")]
    Unauthorized,

    #[error("Command not found: {0}")]
    NotFound(CommandId),

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Invalid response from item store: {0}")]
    InvalidResponse(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pending-work view used by the poll reconciler.
#[async_trait]
pub trait PendingCommandSource: Send + Sync {
    /// Oldest-first batch of pending commands with their device expanded.
    async fn fetch_pending(&self, limit: usize) -> StoreResult<Vec<Command>>;

    /// Terminally fail a command whose device cannot be resolved.
    async fn mark_unroutable(&self, id: &str, reason: &str) -> StoreResult<()>;
}

/// Outcome-writing view used by the status consumer.
#[async_trait]
pub trait CommandReportSink: Send + Sync {
    /// Overwrite status, result, error message and execution time.
    async fn apply_report(&self, id: &str, update: &CommandUpdate) -> StoreResult<()>;
}
