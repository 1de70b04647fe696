//! In-memory command store with a mutation log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CommandReportSink, PendingCommandSource, StoreError, StoreResult};
use crate::command::{Command, CommandStatus, CommandUpdate};

/// A write recorded by [`MemoryCommandStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreMutation {
    Unroutable { id: String, reason: String },
    Report { id: String, update: CommandUpdate },
}

impl StoreMutation {
    pub fn id(&self) -> &str {
        match self {
            StoreMutation::Unroutable { id, .. } | StoreMutation::Report { id, .. } => id,
        }
    }
}

#[derive(Default)]
pub struct MemoryCommandStore {
    commands: RwLock<BTreeMap<String, Command>>,
    mutations: RwLock<Vec<StoreMutation>>,
    unavailable: AtomicBool,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commands(commands: impl IntoIterator<Item = Command>) -> Self {
        let store = Self::new();
        for command in commands {
            store.insert(command);
        }
        store
    }

    pub fn insert(&self, command: Command) {
        self.commands.write().insert(command.id.clone(), command);
    }

    pub fn get(&self, id: &str) -> Option<Command> {
        self.commands.read().get(id).cloned()
    }

    pub fn mutations(&self) -> Vec<StoreMutation> {
        self.mutations.read().clone()
    }

    pub fn mutations_for(&self, id: &str) -> Vec<StoreMutation> {
        self.mutations
            .read()
            .iter()
            .filter(|m| m.id() == id)
            .cloned()
            .collect()
    }

    /// Make every call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }

    fn update(&self, id: &str, update: &CommandUpdate) -> StoreResult<()> {
        let mut commands = self.commands.write();
        let command = commands
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply_to(command);
        Ok(())
    }
}

#[async_trait]
impl PendingCommandSource for MemoryCommandStore {
    async fn fetch_pending(&self, limit: usize) -> StoreResult<Vec<Command>> {
        self.ensure_available()?;
        let mut pending: Vec<Command> = self
            .commands
            .read()
            .values()
            .filter(|c| c.status == CommandStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_unroutable(&self, id: &str, reason: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.update(id, &CommandUpdate::unroutable(reason))?;
        self.mutations.write().push(StoreMutation::Unroutable {
            id: id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl CommandReportSink for MemoryCommandStore {
    async fn apply_report(&self, id: &str, update: &CommandUpdate) -> StoreResult<()> {
        self.ensure_available()?;
        self.update(id, update)?;
        self.mutations.write().push(StoreMutation::Report {
            id: id.to_string(),
            update: update.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_fetch_pending_oldest_first_and_bounded() {
        let now = Utc::now();
        let mut newer = Command::pending("B", "x");
        newer.created_at = Some(now);
        let mut older = Command::pending("A", "x");
        older.created_at = Some(now - Duration::seconds(10));
        let mut done = Command::pending("C", "x");
        done.status = CommandStatus::Completed;

        let store = MemoryCommandStore::with_commands([newer, older, done]);

        let all = store.fetch_pending(10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        assert_eq!(store.fetch_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let store = MemoryCommandStore::new();
        let err = store.mark_unroutable("nope", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryCommandStore::with_commands([Command::pending("A", "x")]);
        store.set_unavailable(true);
        assert!(matches!(
            store.fetch_pending(5).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
