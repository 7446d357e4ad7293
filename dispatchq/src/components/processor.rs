//! 处理器模块
//! Processor module
//!
//! ## 概述 / Overview
//!
//! Processor 运行一组相互独立的消费者循环。每个循环领取一批条目，
//! 逐个交给 [`Dispatcher`] 完成提交协议，然后继续下一轮。
//!
//! The Processor runs a pool of independent consumer loops. Each loop claims a batch of entries,
//! hands them one by one to the [`Dispatcher`] for the commit protocol, then claims again.
//!
//! ## 主要特性 / Key Features
//!
//! - **主题优先级**: 支持严格优先级和加权优先级两种模式
//!   - **Topic priority**: Supports both strict priority and weighted priority modes
//!
//! - **协作式关闭**: 关闭信号在条目之间检查，正在执行的任务不会被中断；
//!   批次中尚未开始的条目保留领取，由回收流程重新投递
//!   - **Cooperative shutdown**: The shutdown signal is checked between entries and an in-flight
//!     execution is never interrupted; entries of the batch that have not started keep their
//!     claim and are redelivered by the reclaim pass
//!
//! - **阻塞领取**: 仅在最低优先级主题上阻塞，避免高优先级条目等待
//!   - **Blocking claim**: Only the lowest priority topic blocks so high priority entries never
//!     wait behind it

use crate::base::{Context, QueueEntry};
use crate::components::dispatcher::Dispatcher;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 处理器参数
/// Processor parameters
pub struct ProcessorParams {
  pub ctx: Context,
  pub dispatcher: Arc<Dispatcher>,
  pub topics: HashMap<String, i32>,
  pub strict_priority: bool,
  pub consumer_group: String,
  /// 消费者名称前缀，第 i 个循环使用 `{prefix}-{i}`
  /// Consumer name prefix; loop i uses `{prefix}-{i}`
  pub consumer_prefix: String,
  pub concurrency: usize,
  pub batch_size: usize,
  pub block_timeout: Duration,
  pub shutdown_timeout: Duration,
  pub active_workers: Arc<AtomicUsize>,
}

struct Shared {
  ctx: Context,
  dispatcher: Arc<Dispatcher>,
  topic_config: HashMap<String, i32>,
  ordered_topics: Option<Vec<String>>,
  consumer_group: String,
  batch_size: usize,
  block_timeout: Duration,
  active_workers: Arc<AtomicUsize>,
}

/// 处理器 - 负责领取条目并驱动执行
/// Processor - responsible for claiming entries and driving their execution
pub struct Processor {
  shared: Arc<Shared>,
  consumer_prefix: String,
  concurrency: usize,
  shutdown_timeout: Duration,
  token: CancellationToken,
  handles: Vec<JoinHandle<()>>,
}

impl Processor {
  /// 创建新的处理器
  /// Create a new processor
  pub fn new(params: ProcessorParams) -> Self {
    let topics = normalize_topics(params.topics);
    let ordered_topics = if params.strict_priority {
      Some(sort_by_priority(&topics))
    } else {
      None
    };

    Self {
      shared: Arc::new(Shared {
        ctx: params.ctx,
        dispatcher: params.dispatcher,
        topic_config: topics,
        ordered_topics,
        consumer_group: params.consumer_group,
        batch_size: params.batch_size.max(1),
        block_timeout: params.block_timeout,
        active_workers: params.active_workers,
      }),
      consumer_prefix: params.consumer_prefix,
      concurrency: params.concurrency.max(1),
      shutdown_timeout: params.shutdown_timeout,
      token: CancellationToken::new(),
      handles: Vec::new(),
    }
  }

  /// 消费者名称
  /// Consumer names
  pub fn consumers(&self) -> Vec<String> {
    (0..self.concurrency)
      .map(|i| format!("{}-{}", self.consumer_prefix, i))
      .collect()
  }

  /// 启动处理器
  /// Start the processor
  pub fn start(&mut self) {
    if !self.handles.is_empty() {
      return;
    }
    for consumer in self.consumers() {
      let shared = Arc::clone(&self.shared);
      let token = self.token.clone();
      self
        .handles
        .push(tokio::spawn(consume(shared, consumer, token)));
    }
    tracing::info!(
      concurrency = self.concurrency,
      group = %self.shared.consumer_group,
      "processor started"
    );
  }

  /// 停止领取新条目（不等待正在执行的任务）
  /// Stop claiming new entries (without waiting for in-flight tasks)
  pub fn stop(&self) {
    self.token.cancel();
  }

  /// 关闭处理器，等待正在执行的任务完成
  /// Shut the processor down, waiting for in-flight tasks to finish
  ///
  /// 执行不会被中断（其时长由 `execution_timeout` 约束）；每经过 `shutdown_timeout`
  /// 仍未结束时记录一次告警。
  /// Executions are never interrupted (their length is bounded by `execution_timeout`); a
  /// warning is logged every `shutdown_timeout` while they are still running.
  pub async fn shutdown(&mut self) {
    self.stop();

    tracing::info!("Waiting for all consumers to finish...");

    let joined = futures::future::join_all(std::mem::take(&mut self.handles));
    tokio::pin!(joined);
    while tokio::time::timeout(self.shutdown_timeout, &mut joined)
      .await
      .is_err()
    {
      tracing::warn!(
        timeout = ?self.shutdown_timeout,
        active = self.shared.active_workers.load(Ordering::Relaxed),
        "consumers still executing after shutdown timeout, waiting for them to finish"
      );
    }

    tracing::info!("All consumers have finished");
  }
}

/// 单个消费者循环
/// A single consumer loop
async fn consume(shared: Arc<Shared>, consumer: String, token: CancellationToken) {
  tracing::debug!(consumer = %consumer, "consumer loop started");
  loop {
    if token.is_cancelled() {
      break;
    }

    let topics = get_topics(&shared.topic_config, shared.ordered_topics.as_ref());
    let claimed = tokio::select! {
      _ = token.cancelled() => break,
      claimed = claim_next(&shared, &topics, &consumer) => claimed,
    };

    match claimed {
      Ok(entries) => {
        for entry in entries {
          if token.is_cancelled() {
            tracing::debug!(
              consumer = %consumer,
              entry_id = %entry.entry_id,
              "shutting down, leaving claimed entry for reclaim"
            );
            break;
          }
          shared.active_workers.fetch_add(1, Ordering::Relaxed);
          handle(&shared, &entry, &consumer).await;
          shared.active_workers.fetch_sub(1, Ordering::Relaxed);
        }
      }
      Err(e) => {
        tracing::error!(consumer = %consumer, error = %e, "claim error");
        tokio::select! {
          _ = token.cancelled() => break,
          _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
      }
    }
  }
  tracing::debug!(consumer = %consumer, "consumer loop exited");
}

async fn handle(shared: &Shared, entry: &QueueEntry, consumer: &str) {
  if let Err(e) = shared.dispatcher.handle_entry(entry, consumer).await {
    tracing::error!(
      task_id = %entry.task_id,
      entry_id = %entry.entry_id,
      error = %e,
      "could not commit entry, leaving it for reclaim"
    );
  }
}

/// 按顺序轮询主题，只在最后一个主题上阻塞
/// Poll topics in order, blocking only on the last one
async fn claim_next(shared: &Shared, topics: &[String], consumer: &str) -> Result<Vec<QueueEntry>> {
  let last = topics.len().saturating_sub(1);
  for (i, topic) in topics.iter().enumerate() {
    let block = if i == last {
      shared.block_timeout
    } else {
      Duration::ZERO
    };
    let entries = shared
      .ctx
      .queue
      .claim(
        topic,
        &shared.consumer_group,
        consumer,
        shared.batch_size,
        block,
      )
      .await?;
    if !entries.is_empty() {
      return Ok(entries);
    }
  }
  Ok(Vec::new())
}

/// 标准化主题配置，确保优先级为正数
/// Normalize topic config, ensure priorities are positive
fn normalize_topics(topics: HashMap<String, i32>) -> HashMap<String, i32> {
  topics
    .into_iter()
    .map(|(name, priority)| (name, priority.max(1)))
    .collect()
}

/// 按优先级排序主题（降序）
/// Sort topics by priority (descending)
fn sort_by_priority(topics: &HashMap<String, i32>) -> Vec<String> {
  let mut topic_vec: Vec<_> = topics.iter().collect();
  topic_vec.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
  topic_vec
    .into_iter()
    .map(|(name, _)| name.clone())
    .collect()
}

/// 获取本轮的主题顺序
/// Get the topic order for this round
fn get_topics(topic_config: &HashMap<String, i32>, ordered_topics: Option<&Vec<String>>) -> Vec<String> {
  if topic_config.len() == 1 {
    return topic_config.keys().cloned().collect();
  }

  if let Some(ordered) = ordered_topics {
    return ordered.clone();
  }

  // 基于优先级加权随机选择
  // Weighted random selection based on priority
  let mut names = Vec::new();
  for (name, &priority) in topic_config {
    for _ in 0..priority {
      names.push(name.clone());
    }
  }

  use rand::seq::SliceRandom;
  let mut rng = rand::rng();
  names.shuffle(&mut rng);

  let mut seen = std::collections::HashSet::new();
  let mut result = Vec::new();
  for name in names {
    if seen.insert(name.clone()) {
      result.push(name);
    }
    if result.len() == topic_config.len() {
      break;
    }
  }
  result
}
