//! Task persistence.
//!
//! The engine saves a task at every task-level transition so that a paused
//! task, checkpoint included, survives a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::task::{Task, TaskId};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether tasks survive a restart.
    fn is_persistent(&self) -> bool;

    async fn save(&self, task: &Task) -> Result<(), String>;

    async fn load(&self, id: TaskId) -> Result<Option<Task>, String>;

    /// All tasks, newest first.
    async fn list(&self) -> Result<Vec<Task>, String>;

    async fn delete(&self, id: TaskId) -> Result<bool, String>;
}

/// Process-local store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn save(&self, task: &Task) -> Result<(), String> {
        self.tasks.write().await.insert(task.id(), task.clone());
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<Option<Task>, String> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Task>, String> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(tasks)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, String> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }
}

/// One JSON file per task under a directory.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
    persist_lock: Arc<Mutex<()>>,
}

impl FileTaskStore {
    pub async fn new(dir: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("Failed to create task store dir: {}", e))?;
        Ok(Self {
            dir,
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read_task(path: &Path) -> Result<Option<Task>, String> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| format!("Failed to parse task {}: {}", path.display(), e)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format!("Failed to read task {}: {}", path.display(), err)),
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn save(&self, task: &Task) -> Result<(), String> {
        let data = serde_json::to_vec_pretty(task)
            .map_err(|e| format!("Failed to serialize task: {}", e))?;
        let path = self.path_for(task.id());
        let tmp_path = path.with_extension("json.tmp");

        let _guard = self.persist_lock.lock().await;
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| format!("Failed to write task: {}", e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| format!("Failed to finalize task: {}", e))?;
        Ok(())
    }

    async fn load(&self, id: TaskId) -> Result<Option<Task>, String> {
        Self::read_task(&self.path_for(id)).await
    }

    async fn list(&self) -> Result<Vec<Task>, String> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| format!("Failed to list task store: {}", e))?;

        let mut tasks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("Failed to list task store: {}", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_task(&path).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                // One corrupt file must not hide the others
                Err(e) => tracing::warn!("{}", e),
            }
        }
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(tasks)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, String> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(format!("Failed to delete task: {}", err)),
        }
    }
}
