//! Command dispatch and reconciliation.
//!
//! Provides:
//! - Command data structures mirroring the item store record
//! - A dedup cache shared by the HTTP trigger and the poll reconciler
//! - The single publish path (`CommandDispatcher`)
//! - The periodic recovery job (`PollReconciler`)
//! - The device report consumer (`StatusConsumer`)
//! - Item store access split into narrow read/write views

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub mod command;
pub mod dedup;
pub mod dispatcher;
pub mod reconciler;
pub mod status;
pub mod store;

pub use command::{Command, CommandId, CommandStatus, CommandUpdate, Device, command_id_of};
pub use dedup::DedupCache;
pub use dispatcher::{CommandDispatcher, DispatchError, DispatchReceipt, DispatchRequest};
pub use reconciler::{CycleReport, PollReconciler, ReconcileError};
pub use status::{AppliedReport, ReportError, StatusConsumer};
pub use store::{
    CommandReportSink, ItemStoreClient, MemoryCommandStore, PendingCommandSource, StoreError,
    StoreMutation,
};

/// Source of the current time, injectable for tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
