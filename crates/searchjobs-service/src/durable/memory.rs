use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{DurableError, DurableStore, Owner, SearchRecord, StoreOutcome};

#[derive(Debug, Default)]
struct Tables {
    /// Maps task ids to the user owning the task.
    tasks: HashMap<Uuid, Uuid>,
    requests: Vec<SearchRecord>,
}

/// A [`DurableStore`] that lives and dies with the process.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    tables: Mutex<Tables>,
}

impl InMemoryDurableStore {
    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        // the tables are consistent after every single statement, so poisoning is harmless
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn newest_first(records: &mut [SearchRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn create_owner(&self) -> Result<Owner, DurableError> {
        let owner = Owner {
            user_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
        };
        self.tables().tasks.insert(owner.task_id, owner.user_id);
        Ok(owner)
    }

    async fn store(&self, record: SearchRecord) -> Result<StoreOutcome, DurableError> {
        let mut tables = self.tables();
        if !tables.tasks.contains_key(&record.task_id) {
            return Err(DurableError::UnknownTask(record.task_id));
        }
        let exists = tables
            .requests
            .iter()
            .any(|r| r.id == record.id && r.task_id == record.task_id);
        if exists {
            return Ok(StoreOutcome::AlreadyExists);
        }
        tables.requests.push(record);
        Ok(StoreOutcome::Stored)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SearchRecord>, DurableError> {
        let mut records = self.tables().requests.clone();
        newest_first(&mut records);
        records.truncate(limit);
        Ok(records)
    }

    async fn for_user(&self, user_id: Uuid) -> Result<Vec<SearchRecord>, DurableError> {
        let tables = self.tables();
        let mut records: Vec<_> = tables
            .requests
            .iter()
            .filter(|r| tables.tasks.get(&r.task_id) == Some(&user_id))
            .cloned()
            .collect();
        newest_first(&mut records);
        Ok(records)
    }
}
