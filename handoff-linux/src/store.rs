//! Task persistence in a single JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use handoff_core::{StoreError, TaskId, TaskStore, TransferTask};
use tokio::sync::Mutex;
use tracing::debug;

/// Whole-file store: every change rewrites the file via temp file + rename.
pub struct JsonTaskStore {
    path: PathBuf,
    tasks: Mutex<BTreeMap<TaskId, TransferTask>>,
}

impl JsonTaskStore {
    /// Open `path`, starting empty when it does not exist yet.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let tasks = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<TransferTask>>(&bytes)?
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), tasks = tasks.len(), "task store opened");
        Ok(Self {
            path: path.to_path_buf(),
            tasks: Mutex::new(tasks),
        })
    }

    async fn write(&self, tasks: &BTreeMap<TaskId, TransferTask>) -> Result<(), StoreError> {
        let mut list: Vec<&TransferTask> = tasks.values().collect();
        list.sort_by_key(|t| t.created_at);
        let bytes = serde_json::to_vec_pretty(&list)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn put_task(&self, task: &TransferTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id.clone(), task.clone());
        self.write(&tasks).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.remove(id).is_some() {
            self.write(&tasks).await?;
        }
        Ok(())
    }

    async fn query_tasks_all(&self) -> Result<Vec<TransferTask>, StoreError> {
        Ok(self.tasks.lock().await.values().cloned().collect())
    }
}
