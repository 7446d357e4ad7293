//! Redis 后端模块
//! Redis backend module
//!
//! Redis Streams 队列与基于哈希的任务记录存储
//! Redis Streams queue and hash-based task record store

pub mod redis_queue;
pub mod redis_scripts;
pub mod redis_store;

pub use redis_queue::RedisQueue;
pub use redis_store::RedisTaskStore;

use crate::base::Context;
use crate::error::Result;
use crate::redis::RedisConnectionConfig;
use std::sync::Arc;

/// 创建队列与记录存储都基于 Redis 的 [`Context`]
/// Build a [`Context`] whose queue and record store are both backed by Redis
pub async fn redis_context(config: &RedisConnectionConfig) -> Result<Context> {
  let (_client, conn) = config.connect().await?;
  let queue = RedisQueue::with_connection(conn.clone()).await?;
  let store = RedisTaskStore::with_connection(conn).await?;
  Ok(Context::new(Arc::new(queue), Arc::new(store)))
}
