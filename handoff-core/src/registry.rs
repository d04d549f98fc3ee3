//! Task registry: the authoritative, ordered catalog of transfer tasks, written through to a store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::task::{TaskId, TerminationOrigin, TransferStatus, TransferTask, TransitionError};

/// External persistence for tasks. May be empty at startup.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn put_task(&self, task: &TransferTask) -> Result<(), StoreError>;
    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError>;
    async fn query_tasks_all(&self) -> Result<Vec<TransferTask>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Store that keeps tasks in memory only.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<TaskId, TransferTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put_task(&self, task: &TransferTask) -> Result<(), StoreError> {
        self.tasks.lock().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError> {
        self.tasks.lock().await.remove(id);
        Ok(())
    }

    async fn query_tasks_all(&self) -> Result<Vec<TransferTask>, StoreError> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }
}

/// Single-writer registry owned by the engine's orchestrator.
/// Iteration follows insertion order, which is also the scheduler's admission order.
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TransferTask>,
    order: Vec<TaskId>,
    store: Arc<dyn TaskStore>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            store,
        }
    }

    /// Load every persisted task, oldest first. Returns the number loaded.
    pub async fn load(&mut self) -> Result<usize, StoreError> {
        let mut stored = self.store.query_tasks_all().await?;
        stored.sort_by_key(|t| t.created_at);
        let mut loaded = 0;
        for task in stored {
            if !self.tasks.contains_key(&task.id) {
                self.order.push(task.id.clone());
                self.tasks.insert(task.id.clone(), task);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TransferTask> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn query(&self, predicate: impl Fn(&TransferTask) -> bool) -> Vec<&TransferTask> {
        self.iter().filter(|t| predicate(t)).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert or replace, then persist.
    pub async fn upsert(&mut self, task: TransferTask) {
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task.clone());
        self.persist(&task).await;
    }

    /// First writer wins: returns false and leaves the registry untouched if `id` exists.
    /// The map is claimed before the store await, so a racing creation sees the task.
    pub async fn insert_if_absent(&mut self, task: TransferTask) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task.clone());
        self.persist(&task).await;
        true
    }

    /// Apply a non-terminal status change.
    pub async fn transition(
        &mut self,
        id: &TaskId,
        next: TransferStatus,
    ) -> Result<TransferTask, RegistryError> {
        let task = self.tasks.get_mut(id).ok_or(RegistryError::Unknown)?;
        task.transition(next)?;
        let snapshot = task.clone();
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Apply a terminal status change with its cause.
    pub async fn terminate(
        &mut self,
        id: &TaskId,
        next: TransferStatus,
        origin: TerminationOrigin,
        message: Option<String>,
    ) -> Result<TransferTask, RegistryError> {
        let task = self.tasks.get_mut(id).ok_or(RegistryError::Unknown)?;
        task.terminate(next, origin, message)?;
        let snapshot = task.clone();
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Mutate a task in place and persist it. Status must be changed through `transition`.
    pub async fn update(
        &mut self,
        id: &TaskId,
        f: impl FnOnce(&mut TransferTask),
    ) -> Option<TransferTask> {
        let task = self.tasks.get_mut(id)?;
        let status = task.status;
        f(task);
        task.status = status;
        let snapshot = task.clone();
        self.persist(&snapshot).await;
        Some(snapshot)
    }

    /// Progress for a transferring task; ignored once the task is terminal.
    /// Kept in memory only: the count reaches the store with the next status change,
    /// and a task still transferring at restart is failed anyway.
    pub fn record_progress(&mut self, id: &TaskId, bytes: u64) -> Option<TransferTask> {
        let task = self
            .tasks
            .get_mut(id)
            .filter(|t| t.status == TransferStatus::Transferring)?;
        task.record_progress(bytes);
        Some(task.clone())
    }

    pub async fn remove(&mut self, id: &TaskId) -> Option<TransferTask> {
        let task = self.tasks.remove(id)?;
        self.order.retain(|o| o != id);
        if let Err(e) = self.store.delete_task(id).await {
            warn!(task = %id, error = %e, "failed to delete task from store");
        }
        Some(task)
    }

    async fn persist(&self, task: &TransferTask) {
        if let Err(e) = self.store.put_task(task).await {
            warn!(task = %task.id, error = %e, "failed to persist task");
        } else {
            debug!(task = %task.id, status = ?task.status, "task persisted");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown task")]
    Unknown,
    #[error(transparent)]
    Transition(#[from] TransitionError),
}
