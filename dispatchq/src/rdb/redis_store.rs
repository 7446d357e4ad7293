//! Redis 任务记录存储
//! Redis task record store
//!
//! 每条记录是一个哈希 `dispatchq:task:<id>`，字段 `version` 与 `data`（JSON）。等待入队的记录
//! 同时登记在有序集合 [`keys::UNQUEUED_INDEX`] 中，分数为 `eligible_at` 毫秒，写入与索引维护
//! 由同一个 Lua 脚本完成。
//!
//! Each record is a hash `dispatchq:task:<id>` with fields `version` and `data` (JSON). Records
//! awaiting an append are also indexed in the sorted set [`keys::UNQUEUED_INDEX`], scored by
//! `eligible_at` millis; the write and the index update happen in the same Lua script.

use crate::base::{keys, TaskStore};
use crate::error::{Error, Result};
use crate::rdb::redis_scripts::{RedisArg, ScriptManager};
use crate::redis::RedisConnectionConfig;
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Redis 任务记录存储
/// Redis task record store
pub struct RedisTaskStore {
  conn: MultiplexedConnection,
  scripts: ScriptManager,
}

impl RedisTaskStore {
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

  fn index_args(task: &Task) -> (RedisArg, RedisArg) {
    let unqueued = RedisArg::Str(if task.is_unqueued() { "1" } else { "0" }.to_string());
    let score = RedisArg::Int(task.eligible_at().timestamp_millis());
    (unqueued, score)
  }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
  async fn ping(&self) -> Result<()> {
    let mut conn = self.conn.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn insert(&self, task: &Task) -> Result<()> {
    let mut conn = self.conn.clone();
    let (unqueued, score) = Self::index_args(task);
    let written: i64 = self
      .scripts
      .eval_script(
        &mut conn,
        "insert_task",
        &[keys::task_key(&task.id), keys::UNQUEUED_INDEX.to_string()],
        &[
          RedisArg::Str(task.version.to_string()),
          RedisArg::Str(serde_json::to_string(task)?),
          unqueued,
          score,
          RedisArg::Str(task.id.clone()),
        ],
      )
      .await?;
    if written == 0 {
      return Err(Error::TaskExists {
        id: task.id.clone(),
      });
    }
    Ok(())
  }

  async fn get(&self, id: &str) -> Result<Option<Task>> {
    let mut conn = self.conn.clone();
    let data: Option<String> = conn.hget(keys::task_key(id), "data").await?;
    match data {
      Some(data) => Ok(Some(serde_json::from_str(&data)?)),
      None => Ok(None),
    }
  }

  async fn compare_and_swap(&self, expected_version: u64, task: &Task) -> Result<bool> {
    let mut conn = self.conn.clone();
    let (unqueued, score) = Self::index_args(task);
    let outcome: i64 = self
      .scripts
      .eval_script(
        &mut conn,
        "cas_task",
        &[keys::task_key(&task.id), keys::UNQUEUED_INDEX.to_string()],
        &[
          RedisArg::Str(expected_version.to_string()),
          RedisArg::Str(task.version.to_string()),
          RedisArg::Str(serde_json::to_string(task)?),
          unqueued,
          score,
          RedisArg::Str(task.id.clone()),
        ],
      )
      .await?;
    match outcome {
      1 => Ok(true),
      0 => Ok(false),
      _ => Err(Error::TaskNotFound {
        id: task.id.clone(),
      }),
    }
  }

  async fn list_unqueued(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
    let mut conn = self.conn.clone();
    let ids: Vec<String> = conn
      .zrangebyscore_limit(
        keys::UNQUEUED_INDEX,
        "-inf",
        cutoff.timestamp_millis(),
        0,
        limit as isize,
      )
      .await?;

    let mut orphans = Vec::with_capacity(ids.len());
    for id in ids {
      match self.get(&id).await? {
        Some(task) if task.is_unqueued() => orphans.push(task),
        Some(_) => {}
        None => {
          // 记录已被删除，清理残留的索引项
          // Record is gone, drop the leftover index member
          let _: i64 = conn.zrem(keys::UNQUEUED_INDEX, &id).await?;
        }
      }
    }
    Ok(orphans)
  }
}
