//! 基础抽象模块
//! Base abstraction module
//!
//! 定义持久队列与任务记录存储的接口，以及贯穿所有组件的 [`Context`]。
//! 队列是投递状态的可信来源，存储是业务状态的可信来源，两者由消费者的提交协议保持一致。
//!
//! Defines the durable queue and task record store interfaces, plus the [`Context`] handed to
//! every component. The queue is the source of truth for delivery state, the store for business
//! state; the consumer's commit protocol keeps them consistent.

use crate::error::{Error, Result};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub mod constants;
pub mod keys;

/// 队列条目 ID：`<毫秒>-<序号>`，单调递增且永不复用
/// Queue entry id: `<millis>-<seq>`, monotonically increasing and never reused
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId {
  ms: u64,
  seq: u64,
}

impl EntryId {
  pub const MIN: EntryId = EntryId { ms: 0, seq: 0 };

  pub fn new(ms: u64, seq: u64) -> Self {
    Self { ms, seq }
  }

  pub fn millis(&self) -> u64 {
    self.ms
  }

  pub fn seq(&self) -> u64 {
    self.seq
  }

  /// 严格大于 `self` 的下一个 ID
  /// The next id strictly greater than `self`
  pub fn successor(&self) -> EntryId {
    match self.seq.checked_add(1) {
      Some(seq) => EntryId { ms: self.ms, seq },
      None => EntryId {
        ms: self.ms + 1,
        seq: 0,
      },
    }
  }
}

impl fmt::Display for EntryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.ms, self.seq)
  }
}

impl FromStr for EntryId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let (ms, seq) = match s.split_once('-') {
      Some((ms, seq)) => (ms, seq),
      None => (s, "0"),
    };
    let ms = ms
      .parse::<u64>()
      .map_err(|_| Error::InvalidEntryId(s.to_string()))?;
    let seq = seq
      .parse::<u64>()
      .map_err(|_| Error::InvalidEntryId(s.to_string()))?;
    Ok(Self { ms, seq })
  }
}

impl TryFrom<String> for EntryId {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> {
    value.parse()
  }
}

impl From<EntryId> for String {
  fn from(id: EntryId) -> Self {
    id.to_string()
  }
}

/// 已领取的队列条目
/// A claimed queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
  pub topic: String,
  pub entry_id: EntryId,
  pub task_id: String,
  /// 队列记录的投递次数（因消费者崩溃导致的重复投递会递增）
  /// Delivery count tracked by the queue (bumped by redelivery after a consumer crash)
  pub delivery_count: u32,
}

/// 死信条目
/// Dead-letter entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
  /// 死信流中的 ID
  /// Id in the dead-letter stream
  pub entry_id: EntryId,
  pub task_id: String,
  pub reason: String,
  /// 原始队列中的条目 ID
  /// Id of the original entry in the topic stream
  pub origin_entry_id: EntryId,
  pub dead_at: DateTime<Utc>,
}

/// 队列统计
/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
  pub topic: String,
  /// 流中仍保留的条目数
  /// Entries still held by the stream
  pub length: u64,
  /// 已领取但未确认的条目数
  /// Claimed but unacknowledged entries
  pub pending: u64,
  pub dead_letters: u64,
}

/// 持久队列
/// Durable queue
///
/// 每个主题一条仅追加的流，每个工作池一个消费者组，每个主题一条死信流。
/// One append-only stream per topic, one consumer group per worker pool, one dead-letter stream
/// per topic.
#[async_trait]
pub trait DurableQueue: Send + Sync {
  /// 检查后端连通性
  /// Check backend connectivity
  async fn ping(&self) -> Result<()>;

  /// 确保主题与消费者组存在（幂等）
  /// Ensure the topic and consumer group exist (idempotent)
  async fn ensure_group(&self, topic: &str, group: &str) -> Result<()>;

  /// 追加一个引用任务的条目
  /// Append an entry referencing a task
  async fn append(&self, topic: &str, task_id: &str) -> Result<EntryId>;

  /// 按条目 ID 升序领取尚未被领取的条目，最多阻塞 `block_timeout`
  /// Claim not-yet-claimed entries in ascending id order, blocking up to `block_timeout`
  async fn claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
    block_timeout: Duration,
  ) -> Result<Vec<QueueEntry>>;

  /// 确认条目，移除领取记录；若条目并未处于领取状态返回 `false`
  /// Acknowledge an entry, removing its claim; returns `false` if it was not claimed
  async fn ack(&self, topic: &str, group: &str, entry_id: &EntryId) -> Result<bool>;

  /// 续期 `consumer` 持有的领取，使其不被回收；领取已不属于该消费者时返回 `false`
  /// Renew a claim held by `consumer` so it is not reclaimed; returns `false` if the claim no
  /// longer belongs to that consumer
  async fn extend_claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    entry_id: &EntryId,
  ) -> Result<bool>;

  /// 将领取时长超过 `claim_timeout` 的条目转移给 `consumer`
  /// Transfer entries whose claim is older than `claim_timeout` to `consumer`
  async fn reclaim_stale(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    claim_timeout: Duration,
    count: usize,
  ) -> Result<Vec<QueueEntry>>;

  /// 将条目移出正常投递路径，写入死信流；死信永不自动回收
  /// Move an entry out of the normal delivery path into the dead-letter stream; dead letters
  /// are never auto-reclaimed
  async fn dead_letter(&self, group: &str, entry: &QueueEntry, reason: &str) -> Result<EntryId>;

  /// 列出主题的死信
  /// List the dead letters of a topic
  async fn list_dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>>;

  /// 查询单条死信
  /// Look up a single dead letter
  async fn get_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<Option<DeadLetter>>;

  /// 将死信重新追加到主题并从死信流删除，返回新条目 ID
  /// Re-append a dead letter to its topic and remove it from the dead-letter stream, returning
  /// the new entry id
  async fn replay_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<EntryId>;

  /// 从死信流删除一条死信而不重新追加，返回是否存在
  /// Remove a dead letter without re-appending it, returning whether it existed
  async fn discard_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<bool>;

  /// 队列统计
  /// Queue statistics
  async fn stats(&self, topic: &str, group: &str) -> Result<QueueStats>;
}

/// 任务记录存储
/// Task record store
///
/// 所有写入都以 `version` 做比较并交换，保证同一任务的并发转换被串行化。
/// Every write is a compare-and-swap on `version`, serializing concurrent transitions of the
/// same task.
#[async_trait]
pub trait TaskStore: Send + Sync {
  /// 检查后端连通性
  /// Check backend connectivity
  async fn ping(&self) -> Result<()>;

  /// 插入新记录；ID 已存在时返回 [`Error::TaskExists`]
  /// Insert a new record; returns [`Error::TaskExists`] if the id is taken
  async fn insert(&self, task: &Task) -> Result<()>;

  /// 读取记录
  /// Load a record
  async fn get(&self, id: &str) -> Result<Option<Task>>;

  /// 仅当已存储版本等于 `expected_version` 时写入 `task`
  /// Write `task` only if the stored version equals `expected_version`
  async fn compare_and_swap(&self, expected_version: u64, task: &Task) -> Result<bool>;

  /// 列出没有有效队列条目、且 `eligible_at` 不晚于 `cutoff` 的 PENDING 记录
  /// List PENDING records without a live queue entry whose `eligible_at` is not after `cutoff`
  async fn list_unqueued(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;
}

/// 记录更新结果
/// Outcome of a record update
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
  /// 新记录已写入
  /// The new record was written
  Applied(Task),
  /// 闭包判断无需写入，附带当前记录
  /// The closure declined to write; carries the current record
  Declined(Task),
}

impl TaskUpdate {
  pub fn task(&self) -> &Task {
    match self {
      TaskUpdate::Applied(t) | TaskUpdate::Declined(t) => t,
    }
  }

  pub fn into_task(self) -> Task {
    match self {
      TaskUpdate::Applied(t) | TaskUpdate::Declined(t) => t,
    }
  }

  pub fn is_applied(&self) -> bool {
    matches!(self, TaskUpdate::Applied(_))
  }
}

/// 组件共享的后端句柄
/// Backend handles shared by every component
#[derive(Clone)]
pub struct Context {
  pub queue: Arc<dyn DurableQueue>,
  pub store: Arc<dyn TaskStore>,
}

impl Context {
  pub fn new(queue: Arc<dyn DurableQueue>, store: Arc<dyn TaskStore>) -> Self {
    Self { queue, store }
  }

  /// 读取-修改-比较并交换，版本冲突时重新读取
  /// Read, modify, compare-and-swap; reloads on a version conflict
  ///
  /// `f` 返回 `Ok(None)` 表示不需要写入。
  /// `f` returning `Ok(None)` means no write is needed.
  pub async fn update_task<F>(&self, id: &str, mut f: F) -> Result<TaskUpdate>
  where
    F: FnMut(&Task) -> Result<Option<Task>> + Send,
  {
    for _ in 0..constants::CAS_RETRIES {
      let current = self
        .store
        .get(id)
        .await?
        .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
      let next = match f(&current)? {
        Some(next) => next,
        None => return Ok(TaskUpdate::Declined(current)),
      };
      if self.store.compare_and_swap(current.version, &next).await? {
        return Ok(TaskUpdate::Applied(next));
      }
      tracing::debug!(task_id = id, "version conflict, reloading task record");
    }
    Err(Error::store(format!(
      "task {id} kept changing concurrently, giving up after {} attempts",
      constants::CAS_RETRIES
    )))
  }

  /// 在未入队的记录上登记条目 ID，返回是否写入
  /// Attach an entry id to an unqueued record, returning whether it was written
  pub async fn attach_entry(&self, id: &str, entry_id: EntryId) -> Result<bool> {
    let update = self
      .update_task(id, |current| {
        if current.is_unqueued() {
          current.attach_entry(entry_id).map(Some)
        } else {
          Ok(None)
        }
      })
      .await?;
    Ok(update.is_applied())
  }

  /// 为已存在的记录追加新条目并登记
  /// Append a fresh entry for an existing record and attach it
  ///
  /// 记录已有有效条目时新条目不会被登记，投递时按过期重复条目丢弃。
  /// If the record already has a live entry the new one is not attached and is dropped as a
  /// stale duplicate on delivery.
  pub async fn enqueue(&self, topic: &str, id: &str) -> Result<EntryId> {
    let entry_id = self.queue.append(topic, id).await?;
    if !self.attach_entry(id, entry_id).await? {
      tracing::debug!(
        task_id = id,
        entry_id = %entry_id,
        "record already has a live entry, new entry left unattached"
      );
    }
    Ok(entry_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_id_parse_and_display() {
    let id: EntryId = "1700000000000-3".parse().unwrap();
    assert_eq!(id.millis(), 1_700_000_000_000);
    assert_eq!(id.seq(), 3);
    assert_eq!(id.to_string(), "1700000000000-3");

    let bare: EntryId = "42".parse().unwrap();
    assert_eq!(bare, EntryId::new(42, 0));

    assert!("abc-1".parse::<EntryId>().is_err());
    assert!("1-x".parse::<EntryId>().is_err());
  }

  #[test]
  fn test_entry_id_ordering() {
    let a = EntryId::new(5, 9);
    let b = EntryId::new(6, 0);
    assert!(a < b);
    assert!(a < a.successor());
    assert_eq!(EntryId::new(1, u64::MAX).successor(), EntryId::new(2, 0));
  }

  #[test]
  fn test_entry_id_serde_as_string() {
    let id = EntryId::new(10, 2);
    let encoded = serde_json::to_string(&id).unwrap();
    assert_eq!(encoded, "\"10-2\"");
    let decoded: EntryId = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, id);
  }
}
