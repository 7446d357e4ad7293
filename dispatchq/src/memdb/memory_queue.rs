//! 内存持久队列实现
//! In-memory durable queue implementation
//!
//! 以内存数据结构模拟流、消费者组和待确认列表，语义与 Redis Streams 保持一致，
//! 不依赖任何外部服务，主要用于测试和单进程部署。
//!
//! Emulates streams, consumer groups and pending-entries lists with in-memory data structures,
//! following Redis Streams semantics without any external service. Mainly used for tests and
//! single-process deployments.

use crate::base::{DeadLetter, DurableQueue, EntryId, QueueEntry, QueueStats};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

/// 一次领取
/// A single claim
#[derive(Debug, Clone)]
pub struct PendingClaim {
  pub consumer: String,
  pub claimed_at: Instant,
  pub delivery_count: u32,
}

/// 消费者组数据
/// Consumer group data
#[derive(Debug, Default)]
pub struct GroupData {
  /// 最后投递的条目 ID，之后的条目才会被新领取
  /// Last delivered entry id; only later entries are handed out by a fresh claim
  pub last_delivered: EntryId,
  /// 待确认列表
  /// Pending-entries list
  pub pending: BTreeMap<EntryId, PendingClaim>,
}

/// 单个主题的流数据
/// Stream data of a single topic
#[derive(Debug, Default)]
pub struct StreamData {
  /// 条目 ID -> 任务 ID
  /// Entry id -> task id
  pub entries: BTreeMap<EntryId, String>,
  pub groups: HashMap<String, GroupData>,
  pub dead: BTreeMap<EntryId, DeadLetter>,
}

impl StreamData {
  /// 删除所有消费者组都已投递且确认的前缀条目
  /// Drop the prefix of entries every group has both delivered and acknowledged
  fn trim_acknowledged(&mut self) {
    let floor = self
      .groups
      .values()
      .map(|g| {
        g.pending
          .keys()
          .next()
          .copied()
          .unwrap_or_else(|| g.last_delivered.successor())
      })
      .min();
    if let Some(floor) = floor {
      self.entries = self.entries.split_off(&floor);
    }
  }
}

/// 内存存储
/// Memory storage
#[derive(Debug, Default)]
pub struct QueueStorage {
  pub streams: HashMap<String, StreamData>,
  /// 最后分配的 ID，所有流共享，保证全局单调
  /// Last id handed out, shared by every stream so ids stay monotonic
  pub last_id: EntryId,
}

impl QueueStorage {
  fn next_id(&mut self) -> EntryId {
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let id = if now > self.last_id.millis() {
      EntryId::new(now, 0)
    } else {
      self.last_id.successor()
    };
    self.last_id = id;
    id
  }

  fn stream_mut(&mut self, topic: &str) -> &mut StreamData {
    self.streams.entry(topic.to_string()).or_default()
  }

  fn group_mut(&mut self, topic: &str, group: &str) -> Result<&mut GroupData> {
    self
      .streams
      .get_mut(topic)
      .and_then(|s| s.groups.get_mut(group))
      .ok_or_else(|| no_group(topic, group))
  }
}

fn no_group(topic: &str, group: &str) -> Error {
  Error::queue(format!(
    "NOGROUP no such consumer group '{group}' for topic '{topic}'"
  ))
}

/// 内存队列
/// Memory queue
pub struct MemoryQueue {
  pub(crate) storage: Arc<RwLock<QueueStorage>>,
  appended: Arc<Notify>,
}

impl Default for MemoryQueue {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryQueue {
  /// 创建新的内存队列
  /// Create a new memory queue
  pub fn new() -> Self {
    Self {
      storage: Arc::new(RwLock::new(QueueStorage::default())),
      appended: Arc::new(Notify::new()),
    }
  }

  /// 获取存储的引用
  /// Get storage reference
  pub fn storage(&self) -> &Arc<RwLock<QueueStorage>> {
    &self.storage
  }

  /// 组内当前的领取（条目 ID，消费者，投递次数）
  /// Current claims within a group (entry id, consumer, delivery count)
  pub async fn pending_claims(&self, topic: &str, group: &str) -> Vec<(EntryId, String, u32)> {
    let storage = self.storage.read().await;
    storage
      .streams
      .get(topic)
      .and_then(|s| s.groups.get(group))
      .map(|g| {
        g.pending
          .iter()
          .map(|(id, c)| (*id, c.consumer.clone(), c.delivery_count))
          .collect()
      })
      .unwrap_or_default()
  }

  fn try_claim(
    storage: &mut QueueStorage,
    topic: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
  ) -> Result<Vec<QueueEntry>> {
    let stream = storage
      .streams
      .get_mut(topic)
      .ok_or_else(|| no_group(topic, group))?;
    let group_data = stream
      .groups
      .get_mut(group)
      .ok_or_else(|| no_group(topic, group))?;

    let fresh: Vec<(EntryId, String)> = stream
      .entries
      .range(group_data.last_delivered.successor()..)
      .take(batch_size)
      .map(|(id, task_id)| (*id, task_id.clone()))
      .collect();

    let now = Instant::now();
    let mut claimed = Vec::with_capacity(fresh.len());
    for (entry_id, task_id) in fresh {
      group_data.last_delivered = entry_id;
      group_data.pending.insert(
        entry_id,
        PendingClaim {
          consumer: consumer.to_string(),
          claimed_at: now,
          delivery_count: 1,
        },
      );
      claimed.push(QueueEntry {
        topic: topic.to_string(),
        entry_id,
        task_id,
        delivery_count: 1,
      });
    }
    Ok(claimed)
  }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
  async fn ping(&self) -> Result<()> {
    // 内存存储始终可用
    // Memory storage is always available
    Ok(())
  }

  async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage
      .stream_mut(topic)
      .groups
      .entry(group.to_string())
      .or_default();
    Ok(())
  }

  async fn append(&self, topic: &str, task_id: &str) -> Result<EntryId> {
    if topic.trim().is_empty() {
      return Err(Error::InvalidTopic {
        name: topic.to_string(),
      });
    }
    let entry_id = {
      let mut storage = self.storage.write().await;
      let entry_id = storage.next_id();
      storage
        .stream_mut(topic)
        .entries
        .insert(entry_id, task_id.to_string());
      entry_id
    };
    self.appended.notify_waiters();
    Ok(entry_id)
  }

  async fn claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
    block_timeout: Duration,
  ) -> Result<Vec<QueueEntry>> {
    let deadline = Instant::now() + block_timeout;
    loop {
      let notified = self.appended.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      {
        let mut storage = self.storage.write().await;
        let claimed = Self::try_claim(&mut storage, topic, group, consumer, batch_size.max(1))?;
        if !claimed.is_empty() {
          return Ok(claimed);
        }
      }

      let now = Instant::now();
      if now >= deadline {
        return Ok(Vec::new());
      }
      if tokio::time::timeout(deadline - now, notified).await.is_err() {
        return Ok(Vec::new());
      }
    }
  }

  async fn ack(&self, topic: &str, group: &str, entry_id: &EntryId) -> Result<bool> {
    let mut storage = self.storage.write().await;
    let acked = storage.group_mut(topic, group)?.pending.remove(entry_id).is_some();
    if acked {
      storage.stream_mut(topic).trim_acknowledged();
    }
    Ok(acked)
  }

  async fn extend_claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    entry_id: &EntryId,
  ) -> Result<bool> {
    let mut storage = self.storage.write().await;
    let group_data = storage.group_mut(topic, group)?;
    match group_data.pending.get_mut(entry_id) {
      Some(claim) if claim.consumer == consumer => {
        claim.claimed_at = Instant::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn reclaim_stale(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    claim_timeout: Duration,
    count: usize,
  ) -> Result<Vec<QueueEntry>> {
    let mut storage = self.storage.write().await;
    let stream = storage
      .streams
      .get_mut(topic)
      .ok_or_else(|| no_group(topic, group))?;
    let group_data = stream
      .groups
      .get_mut(group)
      .ok_or_else(|| no_group(topic, group))?;

    let now = Instant::now();
    let stale: Vec<EntryId> = group_data
      .pending
      .iter()
      .filter(|(_, c)| now.duration_since(c.claimed_at) >= claim_timeout)
      .map(|(id, _)| *id)
      .take(count)
      .collect();

    let mut reclaimed = Vec::with_capacity(stale.len());
    for entry_id in stale {
      // 已删除的条目直接从待确认列表移除
      // Entries deleted from the stream are dropped from the pending list
      let Some(task_id) = stream.entries.get(&entry_id) else {
        group_data.pending.remove(&entry_id);
        continue;
      };
      if let Some(claim) = group_data.pending.get_mut(&entry_id) {
        claim.consumer = consumer.to_string();
        claim.claimed_at = now;
        claim.delivery_count += 1;
        reclaimed.push(QueueEntry {
          topic: topic.to_string(),
          entry_id,
          task_id: task_id.clone(),
          delivery_count: claim.delivery_count,
        });
      }
    }
    Ok(reclaimed)
  }

  async fn dead_letter(&self, group: &str, entry: &QueueEntry, reason: &str) -> Result<EntryId> {
    let mut storage = self.storage.write().await;
    let dead_id = storage.next_id();
    let stream = storage.stream_mut(&entry.topic);
    if let Some(group_data) = stream.groups.get_mut(group) {
      group_data.pending.remove(&entry.entry_id);
    }
    stream.entries.remove(&entry.entry_id);
    stream.dead.insert(
      dead_id,
      DeadLetter {
        entry_id: dead_id,
        task_id: entry.task_id.clone(),
        reason: reason.to_string(),
        origin_entry_id: entry.entry_id,
        dead_at: Utc::now(),
      },
    );
    Ok(dead_id)
  }

  async fn list_dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .streams
        .get(topic)
        .map(|s| s.dead.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn get_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<Option<DeadLetter>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .streams
        .get(topic)
        .and_then(|s| s.dead.get(entry_id))
        .cloned(),
    )
  }

  async fn replay_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<EntryId> {
    let new_id = {
      let mut storage = self.storage.write().await;
      let dead = storage
        .streams
        .get_mut(topic)
        .and_then(|s| s.dead.remove(entry_id))
        .ok_or_else(|| Error::EntryNotFound {
          topic: topic.to_string(),
          entry_id: entry_id.to_string(),
        })?;
      let new_id = storage.next_id();
      storage
        .stream_mut(topic)
        .entries
        .insert(new_id, dead.task_id);
      new_id
    };
    self.appended.notify_waiters();
    Ok(new_id)
  }

  async fn discard_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<bool> {
    let mut storage = self.storage.write().await;
    Ok(
      storage
        .streams
        .get_mut(topic)
        .and_then(|s| s.dead.remove(entry_id))
        .is_some(),
    )
  }

  async fn stats(&self, topic: &str, group: &str) -> Result<QueueStats> {
    let storage = self.storage.read().await;
    let Some(stream) = storage.streams.get(topic) else {
      return Ok(QueueStats {
        topic: topic.to_string(),
        ..Default::default()
      });
    };
    Ok(QueueStats {
      topic: topic.to_string(),
      length: stream.entries.len() as u64,
      pending: stream
        .groups
        .get(group)
        .map_or(0, |g| g.pending.len() as u64),
      dead_letters: stream.dead.len() as u64,
    })
  }
}
