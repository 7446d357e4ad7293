//! Redis Streams 持久队列
//! Redis Streams durable queue
//!
//! 每个主题一条流 `dispatchq:{topic}:stream`，条目只有一个字段 `task_id`；死信写入同一哈希标签下
//! 的 `dispatchq:{topic}:dead`。领取使用消费者组（XREADGROUP），待确认列表（PEL）就是领取记录，
//! XAUTOCLAIM 负责回收超时的领取。
//!
//! One stream per topic `dispatchq:{topic}:stream` whose entries carry a single `task_id` field;
//! dead letters go to `dispatchq:{topic}:dead` under the same hash tag. Claims use consumer groups
//! (XREADGROUP), the pending entries list (PEL) is the claim record, and XAUTOCLAIM reclaims
//! timed-out claims.

use crate::base::{keys, DeadLetter, DurableQueue, EntryId, QueueEntry, QueueStats};
use crate::error::{Error, Result};
use crate::rdb::redis_scripts::{RedisArg, ScriptManager};
use crate::redis::RedisConnectionConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{
  StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
  StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::Instant;

const FIELD_TASK_ID: &str = "task_id";
const FIELD_REASON: &str = "reason";
const FIELD_ORIGIN: &str = "origin_entry_id";
const FIELD_DEAD_AT: &str = "dead_at";

/// 等待新条目时的轮询间隔
/// Poll interval while waiting for new entries
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Redis Streams 队列
/// Redis Streams queue
///
/// 领取等待以短轮询实现，不使用 XREADGROUP BLOCK，多路复用连接上的其他命令不会被阻塞。
/// Waiting for entries is a short poll rather than XREADGROUP BLOCK, so other commands sharing
/// the multiplexed connection are never held up.
pub struct RedisQueue {
  conn: MultiplexedConnection,
  scripts: ScriptManager,
}

impl RedisQueue {
  /// 连接 Redis 并预加载脚本
  /// Connect to Redis and preload the scripts
  pub async fn new(config: &RedisConnectionConfig) -> Result<Self> {
    let (_client, conn) = config.connect().await?;
    Self::with_connection(conn).await
  }

  pub async fn with_connection(mut conn: MultiplexedConnection) -> Result<Self> {
    let mut scripts = ScriptManager::default();
    scripts.load_scripts(&mut conn).await?;
    Ok(Self { conn, scripts })
  }

  async fn read_new(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
  ) -> Result<Vec<QueueEntry>> {
    let mut conn = self.conn.clone();
    let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
      .arg("GROUP")
      .arg(group)
      .arg(consumer)
      .arg("COUNT")
      .arg(batch_size.max(1))
      .arg("STREAMS")
      .arg(keys::stream_key(topic))
      .arg(">")
      .query_async(&mut conn)
      .await?;

    let mut entries = Vec::new();
    for stream in reply.map(|r| r.keys).unwrap_or_default() {
      for id in stream.ids {
        entries.push(to_entry(topic, &id, 1)?);
      }
    }
    Ok(entries)
  }

  async fn delivery_count(&self, topic: &str, group: &str, entry_id: &str) -> Result<u32> {
    let mut conn = self.conn.clone();
    let reply: StreamPendingCountReply = conn
      .xpending_count(keys::stream_key(topic), group, entry_id, entry_id, 1)
      .await?;
    Ok(
      reply
        .ids
        .first()
        .map(|p| p.times_delivered as u32)
        .unwrap_or(1),
    )
  }

  async fn read_dead(&self, topic: &str, start: &str, end: &str) -> Result<Vec<DeadLetter>> {
    let mut conn = self.conn.clone();
    let reply: StreamRangeReply = conn
      .xrange(keys::dead_letter_key(topic), start, end)
      .await?;
    reply.ids.iter().map(to_dead_letter).collect()
  }
}

fn field(id: &StreamId, name: &str) -> Result<String> {
  id.get::<String>(name)
    .ok_or_else(|| Error::queue(format!("entry {} has no {name} field", id.id)))
}

fn to_entry(topic: &str, id: &StreamId, delivery_count: u32) -> Result<QueueEntry> {
  Ok(QueueEntry {
    topic: topic.to_string(),
    entry_id: id.id.parse()?,
    task_id: field(id, FIELD_TASK_ID)?,
    delivery_count,
  })
}

fn to_dead_letter(id: &StreamId) -> Result<DeadLetter> {
  let dead_at_ms: i64 = field(id, FIELD_DEAD_AT)?
    .parse()
    .map_err(|_| Error::queue(format!("dead letter {} has a malformed timestamp", id.id)))?;
  Ok(DeadLetter {
    entry_id: id.id.parse()?,
    task_id: field(id, FIELD_TASK_ID)?,
    reason: field(id, FIELD_REASON)?,
    origin_entry_id: field(id, FIELD_ORIGIN)?.parse()?,
    dead_at: DateTime::<Utc>::from_timestamp_millis(dead_at_ms).unwrap_or_default(),
  })
}

#[async_trait]
impl DurableQueue for RedisQueue {
  async fn ping(&self) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
    let mut conn = self.conn.clone();
    let created: redis::RedisResult<()> = conn
      .xgroup_create_mkstream(keys::stream_key(topic), group, "0")
      .await;
    match created {
      Ok(()) => {}
      Err(e) if e.code() == Some("BUSYGROUP") => {}
      Err(e) => return Err(e.into()),
    }
    let _: i64 = conn.sadd(keys::ALL_TOPICS, topic).await?;
    Ok(())
  }

  async fn append(&self, topic: &str, task_id: &str) -> Result<EntryId> {
    let mut conn = self.conn.clone();
    let id: String = conn
      .xadd(keys::stream_key(topic), "*", &[(FIELD_TASK_ID, task_id)])
      .await?;
    id.parse()
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
      let entries = self.read_new(topic, group, consumer, batch_size).await?;
      let now = Instant::now();
      if !entries.is_empty() || now >= deadline {
        return Ok(entries);
      }
      tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
    }
  }

  async fn ack(&self, topic: &str, group: &str, entry_id: &EntryId) -> Result<bool> {
    let mut conn = self.conn.clone();
    let acked: i64 = self
      .scripts
      .eval_script(
        &mut conn,
        "ack_trim",
        &[keys::stream_key(topic)],
        &[
          RedisArg::Str(group.to_string()),
          RedisArg::Str(entry_id.to_string()),
        ],
      )
      .await?;
    Ok(acked > 0)
  }

  async fn extend_claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    entry_id: &EntryId,
  ) -> Result<bool> {
    let mut conn = self.conn.clone();
    let renewed: i64 = self
      .scripts
      .eval_script(
        &mut conn,
        "extend_claim",
        &[keys::stream_key(topic)],
        &[
          RedisArg::Str(group.to_string()),
          RedisArg::Str(consumer.to_string()),
          RedisArg::Str(entry_id.to_string()),
        ],
      )
      .await?;
    Ok(renewed == 1)
  }

  async fn reclaim_stale(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    claim_timeout: Duration,
    count: usize,
  ) -> Result<Vec<QueueEntry>> {
    let mut conn = self.conn.clone();
    let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
      .arg(keys::stream_key(topic))
      .arg(group)
      .arg(consumer)
      .arg(claim_timeout.as_millis() as u64)
      .arg("0-0")
      .arg("COUNT")
      .arg(count.max(1))
      .query_async(&mut conn)
      .await?;

    if !reply.deleted_ids.is_empty() {
      tracing::warn!(
        topic,
        deleted = ?reply.deleted_ids,
        "claimed entries were deleted from the stream"
      );
    }

    let mut entries = Vec::with_capacity(reply.claimed.len());
    for id in &reply.claimed {
      let delivery_count = self.delivery_count(topic, group, &id.id).await?;
      entries.push(to_entry(topic, id, delivery_count)?);
    }
    Ok(entries)
  }

  async fn dead_letter(&self, group: &str, entry: &QueueEntry, reason: &str) -> Result<EntryId> {
    let mut conn = self.conn.clone();
    let stream = keys::stream_key(&entry.topic);
    let origin = entry.entry_id.to_string();
    let dead_at = Utc::now().timestamp_millis().to_string();

    // 写死信、确认、删除原条目在同一个事务中完成
    // Writing the dead letter, acking and deleting the original run in one transaction
    let (dead_id,): (String,) = redis::pipe()
      .atomic()
      .xadd(
        keys::dead_letter_key(&entry.topic),
        "*",
        &[
          (FIELD_TASK_ID, entry.task_id.as_str()),
          (FIELD_REASON, reason),
          (FIELD_ORIGIN, origin.as_str()),
          (FIELD_DEAD_AT, dead_at.as_str()),
        ],
      )
      .xack(&stream, group, &[&origin])
      .ignore()
      .xdel(&stream, &[&origin])
      .ignore()
      .query_async(&mut conn)
      .await?;
    dead_id.parse()
  }

  async fn list_dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
    self.read_dead(topic, "-", "+").await
  }

  async fn get_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<Option<DeadLetter>> {
    let id = entry_id.to_string();
    Ok(self.read_dead(topic, &id, &id).await?.into_iter().next())
  }

  async fn replay_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<EntryId> {
    let dead = self
      .get_dead_letter(topic, entry_id)
      .await?
      .ok_or_else(|| Error::EntryNotFound {
        topic: topic.to_string(),
        entry_id: entry_id.to_string(),
      })?;

    let mut conn = self.conn.clone();
    let (new_id,): (String,) = redis::pipe()
      .atomic()
      .xadd(
        keys::stream_key(topic),
        "*",
        &[(FIELD_TASK_ID, dead.task_id.as_str())],
      )
      .xdel(keys::dead_letter_key(topic), &[entry_id.to_string()])
      .ignore()
      .query_async(&mut conn)
      .await?;
    new_id.parse()
  }

  async fn discard_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<bool> {
    let mut conn = self.conn.clone();
    let removed: i64 = conn
      .xdel(keys::dead_letter_key(topic), &[entry_id.to_string()])
      .await?;
    Ok(removed > 0)
  }

  async fn stats(&self, topic: &str, group: &str) -> Result<QueueStats> {
    let mut conn = self.conn.clone();
    let stream = keys::stream_key(topic);
    let length: u64 = conn.xlen(&stream).await?;
    let dead_letters: u64 = conn.xlen(keys::dead_letter_key(topic)).await?;
    let pending = match conn.xpending::<_, _, StreamPendingReply>(&stream, group).await {
      Ok(reply) => reply.count() as u64,
      Err(e) if e.code() == Some("NOGROUP") => 0,
      Err(e) => return Err(e.into()),
    };
    Ok(QueueStats {
      topic: topic.to_string(),
      length,
      pending,
      dead_letters,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const GROUP: &str = "test_workers";

  async fn queue() -> RedisQueue {
    let config = RedisConnectionConfig::from_url("redis://127.0.0.1:6379").unwrap();
    RedisQueue::new(&config).await.unwrap()
  }

  fn unique_topic() -> String {
    format!("test:{}", uuid::Uuid::new_v4())
  }

  #[tokio::test]
  #[ignore] // Requires Redis server
  async fn test_redis_claim_ack_cycle() {
    let queue = queue().await;
    let topic = unique_topic();
    queue.ensure_group(&topic, GROUP).await.unwrap();
    queue.ensure_group(&topic, GROUP).await.unwrap();

    let first = queue.append(&topic, "t1").await.unwrap();
    let second = queue.append(&topic, "t2").await.unwrap();
    assert!(first < second);

    let claimed = queue
      .claim(&topic, GROUP, "c1", 10, Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].task_id, "t1");
    assert_eq!(claimed[0].delivery_count, 1);

    // 已领取的条目不会再次被领取
    // Claimed entries are not claimed again
    let again = queue
      .claim(&topic, GROUP, "c2", 10, Duration::from_millis(120))
      .await
      .unwrap();
    assert!(again.is_empty());

    assert!(queue.ack(&topic, GROUP, &first).await.unwrap());
    assert!(!queue.ack(&topic, GROUP, &first).await.unwrap());
    let stats = queue.stats(&topic, GROUP).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.length, 1);

    assert!(queue.ack(&topic, GROUP, &second).await.unwrap());
    let stats = queue.stats(&topic, GROUP).await.unwrap();
    assert_eq!((stats.length, stats.pending), (0, 0));
  }

  #[tokio::test]
  #[ignore] // Requires Redis server
  async fn test_redis_ack_keeps_entries_other_groups_still_need() {
    let queue = queue().await;
    let topic = unique_topic();
    queue.ensure_group(&topic, GROUP).await.unwrap();
    queue.ensure_group(&topic, "audit").await.unwrap();
    let id = queue.append(&topic, "t1").await.unwrap();

    queue
      .claim(&topic, GROUP, "c1", 1, Duration::ZERO)
      .await
      .unwrap();
    assert!(queue.ack(&topic, GROUP, &id).await.unwrap());
    assert_eq!(queue.stats(&topic, GROUP).await.unwrap().length, 1);

    queue
      .claim(&topic, "audit", "a1", 1, Duration::ZERO)
      .await
      .unwrap();
    assert!(queue.ack(&topic, "audit", &id).await.unwrap());
    assert_eq!(queue.stats(&topic, "audit").await.unwrap().length, 0);
  }

  #[tokio::test]
  #[ignore] // Requires Redis server
  async fn test_redis_reclaim_and_extend() {
    let queue = queue().await;
    let topic = unique_topic();
    queue.ensure_group(&topic, GROUP).await.unwrap();
    let id = queue.append(&topic, "t1").await.unwrap();
    queue
      .claim(&topic, GROUP, "crashed", 1, Duration::ZERO)
      .await
      .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(queue
      .extend_claim(&topic, GROUP, "crashed", &id)
      .await
      .unwrap());
    assert!(!queue.extend_claim(&topic, GROUP, "other", &id).await.unwrap());
    let none = queue
      .reclaim_stale(&topic, GROUP, "rescuer", Duration::from_millis(50), 10)
      .await
      .unwrap();
    assert!(none.is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let reclaimed = queue
      .reclaim_stale(&topic, GROUP, "rescuer", Duration::from_millis(50), 10)
      .await
      .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].entry_id, id);
    assert_eq!(reclaimed[0].delivery_count, 2);
  }

  #[tokio::test]
  #[ignore] // Requires Redis server
  async fn test_redis_dead_letter_and_replay() {
    let queue = queue().await;
    let topic = unique_topic();
    queue.ensure_group(&topic, GROUP).await.unwrap();
    queue.append(&topic, "t1").await.unwrap();
    let entry = queue
      .claim(&topic, GROUP, "c1", 1, Duration::ZERO)
      .await
      .unwrap()
      .remove(0);

    let dead_id = queue.dead_letter(GROUP, &entry, "boom").await.unwrap();
    let dead = queue.list_dead_letters(&topic).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "boom");
    assert_eq!(dead[0].origin_entry_id, entry.entry_id);

    let stats = queue.stats(&topic, GROUP).await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.dead_letters, 1);

    let replayed = queue.replay_dead_letter(&topic, &dead_id).await.unwrap();
    assert!(replayed > entry.entry_id);
    assert!(queue.get_dead_letter(&topic, &dead_id).await.unwrap().is_none());
    let claimed = queue
      .claim(&topic, GROUP, "c1", 1, Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(claimed[0].task_id, "t1");
  }
}
