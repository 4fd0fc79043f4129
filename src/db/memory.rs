use crate::db::Store;
use crate::queue::PendingOperation;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    operations: BTreeMap<i64, PendingOperation>,
    state: BTreeMap<String, String>,
}

/// A [`Store`] that lives in memory and is gone when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn load_operations(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.inner().operations.values().cloned().collect())
    }

    async fn insert_operation(&self, op: &PendingOperation) -> Result<i64> {
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        let mut stored = op.clone();
        stored.id = id;
        inner.operations.insert(id, stored);
        Ok(id)
    }

    async fn update_operation(&self, op: &PendingOperation) -> Result<()> {
        let mut inner = self.inner();
        match inner.operations.get_mut(&op.id) {
            Some(stored) => {
                *stored = op.clone();
                Ok(())
            }
            None => anyhow::bail!("Queue entry {} is not stored", op.id),
        }
    }

    async fn delete_operation(&self, id: i64) -> Result<()> {
        self.inner().operations.remove(&id);
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner().state.get(key).cloned())
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.inner()
            .state
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> Result<()> {
        self.inner().state.remove(key);
        Ok(())
    }
}
