//! In-process command store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::CommandStore;
use crate::error::{Error, Result};
use crate::model::{CommandId, CommandModel, Status};

/// Command store held entirely in memory. Ids start at 1.
#[derive(Debug, Default)]
pub struct MemoryCommandStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_id: i64,
    records: BTreeMap<CommandId, CommandModel>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records ever inserted and still held.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    fn list_by_status(&self, status: Status) -> Vec<CommandModel> {
        let mut records: Vec<CommandModel> = self
            .inner
            .lock()
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.queued_at, r.id));
        records
    }
}

// Messages live in the manager's message cache, never in the store.
fn persisted(record: &CommandModel) -> CommandModel {
    let mut record = record.clone();
    record.message = None;
    record
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert(&self, record: &CommandModel) -> Result<CommandId> {
        let mut inner = self.inner.lock();
        inner.last_id += 1;
        let id = CommandId(inner.last_id);

        let mut record = persisted(record);
        record.id = id;
        inner.records.insert(id, record);
        Ok(id)
    }

    async fn update(&self, record: &CommandModel) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.records.get_mut(&record.id) {
            Some(existing) => {
                *existing = persisted(record);
                Ok(())
            }
            None => Err(Error::NotFound(format!("command {}", record.id))),
        }
    }

    async fn get(&self, id: CommandId) -> Result<CommandModel> {
        self.inner
            .lock()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("command {id}")))
    }

    async fn list_queued(&self) -> Result<Vec<CommandModel>> {
        Ok(self.list_by_status(Status::Queued))
    }

    async fn list_started(&self) -> Result<Vec<CommandModel>> {
        Ok(self.list_by_status(Status::Started))
    }

    async fn mark_all_started_as_orphaned(&self) -> Result<u64> {
        let now = Utc::now();
        let mut orphaned = 0;
        for record in self.inner.lock().records.values_mut() {
            if record.status == Status::Started {
                record.finish(Status::Orphaned, now)?;
                orphaned += 1;
            }
        }
        Ok(orphaned)
    }
}
