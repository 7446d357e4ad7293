//! 生产者模块
//! Producer module
//!
//! 创建任务记录并把引用它的条目追加到主题。写入顺序固定为
//! 先插入 PENDING 记录，再追加条目，最后在记录上登记条目 ID。
//! 追加失败时记录保持为未入队状态，由协调器在宽限期后补投。
//!
//! Creates task records and appends an entry referencing each one to its topic. The write order
//! is fixed: insert the PENDING record, append the entry, then attach the entry id to the record.
//! When the append fails the record stays unqueued and the reconciler re-appends it after the
//! grace period.

use crate::base::{Context, EntryId};
use crate::config::ProducerConfig;
use crate::error::{Error, Result};
use crate::task::{IntentType, Priority, Task};

/// 任务生产者
/// Task producer
#[derive(Clone)]
pub struct Producer {
  ctx: Context,
  config: ProducerConfig,
}

impl Producer {
  /// 创建新的生产者
  /// Create a new producer
  pub fn new(ctx: Context) -> Self {
    Self {
      ctx,
      config: ProducerConfig::default(),
    }
  }

  /// 使用指定配置创建生产者
  /// Create a producer with the specified configuration
  pub fn with_config(ctx: Context, config: ProducerConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self { ctx, config })
  }

  pub fn config(&self) -> &ProducerConfig {
    &self.config
  }

  /// 以普通优先级提交任务，返回任务 ID
  /// Submit a task at normal priority, returning its id
  pub async fn submit_task<I, U>(
    &self,
    intent: I,
    payload: serde_json::Value,
    user_id: U,
  ) -> Result<String>
  where
    I: Into<IntentType>,
    U: AsRef<str>,
  {
    self
      .submit_task_with_priority(intent, payload, user_id, Priority::Normal)
      .await
  }

  /// 以指定优先级提交任务
  /// Submit a task at the given priority
  pub async fn submit_task_with_priority<I, U>(
    &self,
    intent: I,
    payload: serde_json::Value,
    user_id: U,
    priority: Priority,
  ) -> Result<String>
  where
    I: Into<IntentType>,
    U: AsRef<str>,
  {
    let task = Task::new(intent, payload, user_id)?
      .with_priority(priority)
      .with_max_attempts(self.config.max_attempts);
    self.submit(task).await
  }

  /// 提交已构建的任务
  /// Submit a prebuilt task
  ///
  /// 未显式设置主题时按优先级选择主题，任务自带的最大尝试次数保持不变。
  /// The topic is chosen by priority unless set explicitly; the task's own max attempts are kept.
  pub async fn submit(&self, mut task: Task) -> Result<String> {
    if task.topic.is_empty() {
      task.topic = self.config.topic_for(task.priority).to_string();
    }
    if task.max_attempts == 0 {
      task.max_attempts = self.config.max_attempts;
    }

    self.ctx.store.insert(&task).await?;

    let entry_id = match self.ctx.queue.append(&task.topic, &task.id).await {
      Ok(entry_id) => entry_id,
      Err(e) => {
        tracing::warn!(
          task_id = %task.id,
          topic = %task.topic,
          error = %e,
          "append failed, task left for reconciliation"
        );
        return Err(Error::EnqueueDeferred {
          task_id: task.id,
          message: e.to_string(),
        });
      }
    };

    self.attach(&task.id, entry_id).await;

    tracing::info!(
      task_id = %task.id,
      intent = %task.intent,
      topic = %task.topic,
      entry_id = %entry_id,
      "task submitted"
    );
    Ok(task.id)
  }

  /// 在记录上登记条目 ID；失败不影响提交结果，条目已持久化
  /// Attach the entry id to the record; a failure does not fail the submission since the entry
  /// is already durable
  async fn attach(&self, task_id: &str, entry_id: EntryId) {
    if let Err(e) = self.ctx.attach_entry(task_id, entry_id).await {
      tracing::warn!(
        task_id,
        entry_id = %entry_id,
        error = %e,
        "could not attach entry id to task record"
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::constants::{DEFAULT_MAX_ATTEMPTS, TOPIC_HIGH, TOPIC_NORMAL};
  use crate::base::{DurableQueue, TaskStore};
  use crate::memdb::memory_context;
  use crate::task::TaskState;
  use serde_json::json;

  #[tokio::test]
  async fn test_submit_task_creates_pending_record_with_entry() {
    let (ctx, queue, store) = memory_context();
    let producer = Producer::new(ctx);

    let id = producer
      .submit_task(
        IntentType::RestaurantBooking,
        json!({"restaurant": "Luigi's", "party_size": 2}),
        "user-7",
      )
      .await
      .unwrap();

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(task.topic, TOPIC_NORMAL);
    assert!(task.entry_id.is_some());

    queue.ensure_group(TOPIC_NORMAL, "g").await.unwrap();
    let entries = queue
      .claim(TOPIC_NORMAL, "g", "c", 10, std::time::Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, id);
    assert_eq!(Some(entries[0].entry_id), task.entry_id);
  }

  #[tokio::test]
  async fn test_submit_task_routes_by_priority() {
    let (ctx, _queue, store) = memory_context();
    let producer = Producer::with_config(ctx, ProducerConfig::new().max_attempts(5)).unwrap();

    let id = producer
      .submit_task_with_priority(
        "medicine_reminder",
        json!({"medicine": "aspirin"}),
        "user-1",
        Priority::High,
      )
      .await
      .unwrap();

    let task = store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.topic, TOPIC_HIGH);
    assert_eq!(task.max_attempts, 5);
  }

  #[tokio::test]
  async fn test_submit_rejects_empty_intent() {
    let (ctx, _queue, store) = memory_context();
    let producer = Producer::new(ctx);
    assert!(producer.submit_task("", json!({}), "user-1").await.is_err());
    assert!(store.snapshot().await.is_empty());
  }

  #[tokio::test]
  async fn test_submit_duplicate_id() {
    let (ctx, _queue, _store) = memory_context();
    let producer = Producer::new(ctx);
    let task = Task::new("salon_booking", json!({}), "user-1")
      .unwrap()
      .with_id("fixed-id");
    producer.submit(task.clone()).await.unwrap();
    assert!(matches!(
      producer.submit(task).await,
      Err(Error::TaskExists { .. })
    ));
  }
}
