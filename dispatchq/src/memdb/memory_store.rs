//! 内存任务记录存储
//! In-memory task record store

use crate::base::TaskStore;
use crate::error::{Error, Result};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 内存任务存储
/// Memory task store
#[derive(Default)]
pub struct MemoryStore {
  pub(crate) tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// 当前所有记录的快照
  /// Snapshot of every record
  pub async fn snapshot(&self) -> Vec<Task> {
    let tasks = self.tasks.read().await;
    let mut all: Vec<Task> = tasks.values().cloned().collect();
    all.sort_by_key(|t| t.created_at);
    all
  }
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn ping(&self) -> Result<()> {
    Ok(())
  }

  async fn insert(&self, task: &Task) -> Result<()> {
    let mut tasks = self.tasks.write().await;
    if tasks.contains_key(&task.id) {
      return Err(Error::TaskExists {
        id: task.id.clone(),
      });
    }
    tasks.insert(task.id.clone(), task.clone());
    Ok(())
  }

  async fn get(&self, id: &str) -> Result<Option<Task>> {
    let tasks = self.tasks.read().await;
    Ok(tasks.get(id).cloned())
  }

  async fn compare_and_swap(&self, expected_version: u64, task: &Task) -> Result<bool> {
    let mut tasks = self.tasks.write().await;
    match tasks.get_mut(&task.id) {
      Some(current) if current.version == expected_version => {
        *current = task.clone();
        Ok(true)
      }
      Some(_) => Ok(false),
      None => Err(Error::TaskNotFound {
        id: task.id.clone(),
      }),
    }
  }

  async fn list_unqueued(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
    let tasks = self.tasks.read().await;
    let mut orphans: Vec<Task> = tasks
      .values()
      .filter(|t| t.is_unqueued() && t.eligible_at() <= cutoff)
      .cloned()
      .collect();
    orphans.sort_by_key(|t| t.eligible_at());
    orphans.truncate(limit);
    Ok(orphans)
  }
}
