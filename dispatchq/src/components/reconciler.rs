//! Reconciler 模块
//! Reconciler module
//!
//! 定期为没有有效队列条目的 PENDING 记录重新追加条目。这类孤儿来自生产者追加失败、
//! 重试延迟期间工作进程退出，或登记条目 ID 失败。宽限期避免与正常的延迟重试竞争。
//!
//! Periodically re-appends an entry for PENDING records that have no live queue entry. Such
//! orphans come from a failed producer append, a worker exiting during a retry delay, or a failed
//! entry-id attach. The grace period keeps the sweep from racing ordinary delayed retries.

use crate::base::Context;
use crate::components::ComponentLifecycle;
use crate::error::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Reconciler 配置
/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
  /// 扫描间隔
  /// Sweep interval
  pub interval: Duration,
  /// 宽限期
  /// Grace period
  pub grace: Duration,
  /// 批量大小
  /// Batch size
  pub batch_size: usize,
}

impl Default for ReconcilerConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(30),
      grace: crate::base::constants::DEFAULT_RECONCILE_GRACE,
      batch_size: 100,
    }
  }
}

/// Reconciler - 负责恢复未入队的孤儿任务
/// Reconciler - responsible for recovering unqueued orphan tasks
pub struct Reconciler {
  ctx: Context,
  config: ReconcilerConfig,
  done: Arc<AtomicBool>,
  wake: Arc<Notify>,
}

impl Reconciler {
  /// 创建新的 Reconciler
  /// Create a new Reconciler
  pub fn new(ctx: Context, config: ReconcilerConfig) -> Self {
    Self {
      ctx,
      config,
      done: Arc::new(AtomicBool::new(false)),
      wake: Arc::new(Notify::new()),
    }
  }

  /// 启动 Reconciler
  /// Start the Reconciler
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      loop {
        tokio::select! {
          _ = interval.tick() => {}
          _ = self.wake.notified() => {}
        }

        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("Reconciler: shutting down");
          break;
        }

        if let Err(e) = self.reconcile().await {
          tracing::error!("Reconciler error: {}", e);
        }
      }
    })
  }

  /// 执行一轮扫描，返回重新追加的任务数
  /// Run one sweep, returning the number of re-appended tasks
  pub async fn reconcile(&self) -> Result<usize> {
    let grace = chrono::Duration::from_std(self.config.grace).unwrap_or_default();
    let cutoff = Utc::now() - grace;
    let orphans = self
      .ctx
      .store
      .list_unqueued(cutoff, self.config.batch_size)
      .await?;

    let mut appended = 0;
    for task in orphans {
      if task.topic.is_empty() {
        tracing::warn!(task_id = %task.id, "Reconciler: orphan has no topic, skipping");
        continue;
      }
      match self.ctx.enqueue(&task.topic, &task.id).await {
        Ok(entry_id) => {
          appended += 1;
          tracing::info!(
            task_id = %task.id,
            topic = %task.topic,
            entry_id = %entry_id,
            "Reconciler: re-appended orphaned task"
          );
        }
        Err(e) => tracing::warn!(
          task_id = %task.id,
          "Reconciler: could not re-append orphaned task: {}",
          e
        ),
      }
    }
    Ok(appended)
  }

  /// 停止 Reconciler
  /// Stop the Reconciler
  pub fn shutdown(&self) {
    self.done.store(true, Ordering::Relaxed);
    self.wake.notify_one();
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Relaxed)
  }
}

impl ComponentLifecycle for Reconciler {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Reconciler::start(self)
  }

  fn shutdown(&self) {
    Reconciler::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Reconciler::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::TaskStore;
  use crate::memdb::memory_context;
  use crate::task::Task;
  use serde_json::json;

  #[test]
  fn test_reconciler_config_default() {
    let config = ReconcilerConfig::default();
    assert_eq!(config.interval, Duration::from_secs(30));
    assert_eq!(config.grace, Duration::from_secs(60));
    assert_eq!(config.batch_size, 100);
  }

  #[tokio::test]
  async fn test_reconcile_respects_grace_and_attaches_entry() {
    let (ctx, _queue, store) = memory_context();
    let orphan = Task::new("salon_booking", json!({}), "u")
      .unwrap()
      .with_topic("tasks:normal");
    store.insert(&orphan).await.unwrap();

    let patient = Reconciler::new(
      ctx.clone(),
      ReconcilerConfig {
        grace: Duration::from_secs(3600),
        ..ReconcilerConfig::default()
      },
    );
    assert_eq!(patient.reconcile().await.unwrap(), 0);

    let eager = Reconciler::new(
      ctx,
      ReconcilerConfig {
        grace: Duration::ZERO,
        ..ReconcilerConfig::default()
      },
    );
    assert_eq!(eager.reconcile().await.unwrap(), 1);
    let record = store.get(&orphan.id).await.unwrap().unwrap();
    assert!(record.entry_id.is_some());

    // 已登记条目的记录不再是孤儿
    // A record with an attached entry is no longer an orphan
    assert_eq!(eager.reconcile().await.unwrap(), 0);
  }
}
