//! Periodic recovery path for pending commands.
//!
//! Every tick spawns a cycle. A cycle that starts while another is still
//! running is skipped, not queued. Successful dispatch only records a dedup
//! entry; command status is advanced by device reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cmdlink_core::{PollConfig, command_topic};

use crate::Clock;
use crate::command::Command;
use crate::dedup::DedupCache;
use crate::dispatcher::{CommandDispatcher, DispatchRequest};
use crate::store::PendingCommandSource;

/// Per-command reconciliation errors.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReconcileError {
    /// Terminal: the command is marked failed with this message and never retried.
    #[error("Device could not be resolved for command {command_id}: no device address")]
    DeviceUnresolved { command_id: String },
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub fetched: usize,
    pub dispatched: usize,
    /// Still inside the dedup cooldown.
    pub skipped: usize,
    /// No resolvable device; marked failed.
    pub unresolved: usize,
    /// Dispatch failed; left pending for the next cycle.
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

/// Clears the single-flight flag when the cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollReconciler {
    source: Arc<dyn PendingCommandSource>,
    dispatcher: Arc<CommandDispatcher>,
    dedup: Arc<DedupCache>,
    config: PollConfig,
    clock: Clock,
    in_flight: AtomicBool,
    last_cycle: RwLock<Option<CycleReport>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollReconciler {
    pub fn new(
        source: Arc<dyn PendingCommandSource>,
        dispatcher: Arc<CommandDispatcher>,
        dedup: Arc<DedupCache>,
        config: PollConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            dedup,
            config,
            clock: crate::system_clock(),
            in_flight: AtomicBool::new(false),
            last_cycle: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the periodic timer is active.
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Whether a cycle is executing right now.
    pub fn cycle_in_progress(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle.read().clone()
    }

    /// Start the periodic timer. The first cycle runs immediately.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let reconciler = Arc::clone(self);
        let interval = self.config.interval;
        info!(
            interval_secs = interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting poll reconciler"
        );

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move {
                    reconciler.run_cycle().await;
                });
            }
        }));
    }

    /// Stop the timer. A cycle already executing runs to completion.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Poll reconciler stopped");
        }
    }

    /// Run one cycle unless another is in flight. Returns `None` when skipped.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous reconciliation cycle still running, skipping");
            return None;
        }
        let _guard = CycleGuard(&self.in_flight);

        let started_at = (self.clock)();
        let timer = std::time::Instant::now();
        let mut report = CycleReport {
            started_at: Some(started_at),
            ..Default::default()
        };

        match self.source.fetch_pending(self.config.batch_size).await {
            Ok(commands) => {
                report.fetched = commands.len();
                for command in &commands {
                    self.reconcile(command, &mut report).await;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch pending commands");
                report.fetch_error = Some(e.to_string());
            }
        }

        report.duration_ms = timer.elapsed().as_millis() as u64;
        if report.fetched > 0 || report.fetch_error.is_some() {
            info!(
                fetched = report.fetched,
                dispatched = report.dispatched,
                skipped = report.skipped,
                unresolved = report.unresolved,
                failed = report.failed,
                duration_ms = report.duration_ms,
                "Reconciliation cycle finished"
            );
        } else {
            debug!("Reconciliation cycle found no pending commands");
        }

        *self.last_cycle.write() = Some(report.clone());
        Some(report)
    }

    async fn reconcile(&self, command: &Command, report: &mut CycleReport) {
        let id = command.id.as_str();

        if !self.dedup.should_dispatch(id, (self.clock)()) {
            debug!(command_id = %id, "Command recently dispatched, skipping");
            report.skipped += 1;
            return;
        }

        let Some(address) = command.device_address() else {
            report.unresolved += 1;
            let unresolved = ReconcileError::DeviceUnresolved {
                command_id: id.to_string(),
            };
            match self.source.mark_unroutable(id, &unresolved.to_string()).await {
                Ok(()) => warn!(command_id = %id, error = %unresolved, "Command marked failed"),
                Err(e) => error!(command_id = %id, error = %e, "Failed to mark unroutable command"),
            }
            return;
        };

        let request = DispatchRequest::new(command_topic(address), command.dispatch_payload());
        match self.dispatcher.dispatch(request).await {
            Ok(receipt) => {
                self.dedup.record_dispatch(id, (self.clock)());
                report.dispatched += 1;
                info!(
                    command_id = %id,
                    device = %address,
                    topic = %receipt.topic,
                    "Pending command dispatched"
                );
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    command_id = %id,
                    device = %address,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Pending command dispatch failed"
                );
            }
        }
    }
}

impl Drop for PollReconciler {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
