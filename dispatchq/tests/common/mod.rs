//! 集成测试共用的工具
//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use dispatchq::base::{
  Context, DeadLetter, DurableQueue, EntryId, QueueEntry, QueueStats, TaskStore,
};
use dispatchq::components::dispatcher::Dispatcher;
use dispatchq::config::WorkerConfig;
use dispatchq::error::{Error, Result};
use dispatchq::executor::{ExecuteError, ExecuteResult, TaskExecutor};
use dispatchq::memdb::{MemoryQueue, MemoryStore};
use dispatchq::task::Task;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "tasks:normal";

/// 按预设脚本返回结果的执行器，并记录调用次数
/// Executor returning scripted results and counting its calls
#[derive(Clone)]
pub struct ScriptedExecutor {
  calls: Arc<AtomicUsize>,
  transient_failures: usize,
  permanent: bool,
}

impl ScriptedExecutor {
  /// 前 `n` 次返回暂时性失败，之后成功
  /// Transient failure for the first `n` calls, then success
  pub fn failing_times(n: usize) -> Self {
    Self {
      calls: Arc::new(AtomicUsize::new(0)),
      transient_failures: n,
      permanent: false,
    }
  }

  pub fn always_transient() -> Self {
    Self::failing_times(usize::MAX)
  }

  pub fn succeeding() -> Self {
    Self::failing_times(0)
  }

  pub fn permanent() -> Self {
    Self {
      calls: Arc::new(AtomicUsize::new(0)),
      transient_failures: 0,
      permanent: true,
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
  async fn execute(&self, task: &Task) -> ExecuteResult {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if self.permanent {
      return Err(ExecuteError::permanent("business rule rejected the request"));
    }
    if call <= self.transient_failures {
      return Err(ExecuteError::transient(format!(
        "provider unavailable (call {call})"
      )));
    }
    Ok(json!({"task_id": task.id, "call": call}))
  }
}

/// 可以让追加失败的队列包装
/// Queue wrapper whose appends can be made to fail
pub struct FlakyQueue {
  inner: MemoryQueue,
  fail_appends: AtomicBool,
}

impl FlakyQueue {
  pub fn new() -> Self {
    Self {
      inner: MemoryQueue::new(),
      fail_appends: AtomicBool::new(false),
    }
  }

  pub fn fail_appends(&self, fail: bool) {
    self.fail_appends.store(fail, Ordering::SeqCst);
  }
}

#[async_trait]
impl DurableQueue for FlakyQueue {
  async fn ping(&self) -> Result<()> {
    self.inner.ping().await
  }

  async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
    self.inner.ensure_group(topic, group).await
  }

  async fn append(&self, topic: &str, task_id: &str) -> Result<EntryId> {
    if self.fail_appends.load(Ordering::SeqCst) {
      return Err(Error::queue("connection refused"));
    }
    self.inner.append(topic, task_id).await
  }

  async fn claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    batch_size: usize,
    block_timeout: Duration,
  ) -> Result<Vec<QueueEntry>> {
    self
      .inner
      .claim(topic, group, consumer, batch_size, block_timeout)
      .await
  }

  async fn ack(&self, topic: &str, group: &str, entry_id: &EntryId) -> Result<bool> {
    self.inner.ack(topic, group, entry_id).await
  }

  async fn extend_claim(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    entry_id: &EntryId,
  ) -> Result<bool> {
    self.inner.extend_claim(topic, group, consumer, entry_id).await
  }

  async fn reclaim_stale(
    &self,
    topic: &str,
    group: &str,
    consumer: &str,
    claim_timeout: Duration,
    count: usize,
  ) -> Result<Vec<QueueEntry>> {
    self
      .inner
      .reclaim_stale(topic, group, consumer, claim_timeout, count)
      .await
  }

  async fn dead_letter(&self, group: &str, entry: &QueueEntry, reason: &str) -> Result<EntryId> {
    self.inner.dead_letter(group, entry, reason).await
  }

  async fn list_dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
    self.inner.list_dead_letters(topic).await
  }

  async fn get_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<Option<DeadLetter>> {
    self.inner.get_dead_letter(topic, entry_id).await
  }

  async fn replay_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<EntryId> {
    self.inner.replay_dead_letter(topic, entry_id).await
  }

  async fn discard_dead_letter(&self, topic: &str, entry_id: &EntryId) -> Result<bool> {
    self.inner.discard_dead_letter(topic, entry_id).await
  }

  async fn stats(&self, topic: &str, group: &str) -> Result<QueueStats> {
    self.inner.stats(topic, group).await
  }
}

pub fn dispatcher<E: TaskExecutor + 'static>(
  ctx: &Context,
  executor: E,
  config: &WorkerConfig,
) -> Dispatcher {
  Dispatcher::new(
    ctx.clone(),
    Arc::new(executor),
    config,
    CancellationToken::new(),
  )
}

/// 领取一个条目，最多等待一秒
/// Claim a single entry, waiting up to one second
pub async fn claim_one(ctx: &Context, config: &WorkerConfig, consumer: &str) -> Option<QueueEntry> {
  ctx
    .queue
    .claim(TOPIC, &config.consumer_group, consumer, 1, Duration::from_secs(1))
    .await
    .unwrap()
    .into_iter()
    .next()
}

pub async fn record(store: &MemoryStore, id: &str) -> Task {
  store.get(id).await.unwrap().unwrap()
}

/// 轮询直到条件成立或超时
/// Poll until the condition holds or the timeout passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if condition().await {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  condition().await
}
