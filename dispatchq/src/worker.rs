//! 工作进程模块
//! Worker module
//!
//! 在一个 [`Context`] 上装配消费者池、回收器和协调器，运行到收到停止信号为止。
//! 多个工作进程之间只通过队列和记录存储协作。
//!
//! Wires the consumer pool, the recoverer and the reconciler over a [`Context`] and runs until a
//! stop signal. Worker processes coordinate only through the queue and the record store.

use crate::base::Context;
use crate::components::dispatcher::Dispatcher;
use crate::components::processor::{Processor, ProcessorParams};
use crate::components::reconciler::{Reconciler, ReconcilerConfig};
use crate::components::recoverer::{Recoverer, RecovererConfig};
use crate::components::ComponentLifecycle;
pub use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::executor::TaskExecutor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 工作进程状态
/// Worker state
#[derive(Debug, Clone, Copy, PartialEq)]
enum WorkerState {
  New,
  Running,
  Closed,
}

/// 工作进程，负责领取并执行任务
/// Worker, responsible for claiming and executing tasks
pub struct Worker {
  ctx: Context,
  config: WorkerConfig,
  state: WorkerState,
  host: String,
  pid: u32,
  worker_uuid: String,
  active_workers: Arc<AtomicUsize>,
  shutdown: CancellationToken,
  processor: Option<Processor>,
  components: Vec<(Arc<dyn ComponentLifecycle + Send + Sync>, JoinHandle<()>)>,
}

impl Worker {
  /// 创建新的工作进程
  /// Create a new worker
  pub fn new(ctx: Context, config: WorkerConfig) -> Result<Self> {
    config.validate()?;

    let host = hostname::get()
      .unwrap_or_default()
      .to_string_lossy()
      .to_string();

    Ok(Self {
      ctx,
      config,
      state: WorkerState::New,
      host,
      pid: std::process::id(),
      worker_uuid: Uuid::new_v4().to_string(),
      active_workers: Arc::new(AtomicUsize::new(0)),
      shutdown: CancellationToken::new(),
      processor: None,
      components: Vec::new(),
    })
  }

  /// 组合 ID（hostname:pid:uuid），用作消费者名称前缀
  /// Combined id (hostname:pid:uuid), used as the consumer name prefix
  pub fn full_worker_id(&self) -> String {
    format!("{}:{}:{}", self.host, self.pid, self.worker_uuid)
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// 正在执行的任务数
  /// Number of tasks currently executing
  pub fn active_workers(&self) -> usize {
    self.active_workers.load(Ordering::Relaxed)
  }

  /// Ping 队列与记录存储
  /// Ping the queue and the record store
  pub async fn ping(&self) -> Result<()> {
    self.ctx.queue.ping().await?;
    self.ctx.store.ping().await
  }

  /// 启动所有组件后立即返回
  /// Start every component and return immediately
  pub async fn start<E>(&mut self, executor: E) -> Result<()>
  where
    E: TaskExecutor + 'static,
  {
    match self.state {
      WorkerState::New => {}
      WorkerState::Running => return Err(Error::WorkerRunning),
      WorkerState::Closed => return Err(Error::WorkerClosed),
    }

    let topics = self.config.ordered_topics();
    for topic in &topics {
      self
        .ctx
        .queue
        .ensure_group(topic, &self.config.consumer_group)
        .await?;
    }

    let worker_id = self.full_worker_id();
    let dispatcher = Arc::new(Dispatcher::new(
      self.ctx.clone(),
      Arc::new(executor),
      &self.config,
      self.shutdown.clone(),
    ));

    // 启动 Recoverer - 回收失联消费者的条目
    // Start Recoverer - reclaim entries of lost consumers
    let recoverer = Arc::new(Recoverer::new(
      self.ctx.clone(),
      Arc::clone(&dispatcher),
      RecovererConfig {
        interval: self.config.reclaim_interval,
        claim_timeout: self.config.claim_timeout,
        batch_size: self.config.reclaim_batch,
        topics: topics.clone(),
        consumer_group: self.config.consumer_group.clone(),
        consumer: format!("{worker_id}-recoverer"),
      },
    ));
    let recoverer_handle = recoverer.clone().start();
    self.components.push((
      recoverer as Arc<dyn ComponentLifecycle + Send + Sync>,
      recoverer_handle,
    ));

    // 启动 Reconciler - 补投未入队的孤儿任务
    // Start Reconciler - re-append unqueued orphan tasks
    let reconciler = Arc::new(Reconciler::new(
      self.ctx.clone(),
      ReconcilerConfig {
        interval: self.config.reconcile_interval,
        grace: self.config.reconcile_grace,
        batch_size: self.config.reconcile_batch,
      },
    ));
    let reconciler_handle = reconciler.clone().start();
    self.components.push((
      reconciler as Arc<dyn ComponentLifecycle + Send + Sync>,
      reconciler_handle,
    ));

    let mut processor = Processor::new(ProcessorParams {
      ctx: self.ctx.clone(),
      dispatcher,
      topics: self.config.topics.clone(),
      strict_priority: self.config.strict_priority,
      consumer_group: self.config.consumer_group.clone(),
      consumer_prefix: worker_id.clone(),
      concurrency: self.config.concurrency,
      batch_size: self.config.batch_size,
      block_timeout: self.config.block_timeout,
      shutdown_timeout: self.config.shutdown_timeout,
      active_workers: Arc::clone(&self.active_workers),
    });
    processor.start();
    self.processor = Some(processor);

    self.state = WorkerState::Running;
    tracing::info!(worker_id = %worker_id, topics = ?topics, "worker started");
    Ok(())
  }

  /// 运行工作进程直到收到停止信号
  /// Run the worker until a stop signal is received
  pub async fn run<E>(&mut self, executor: E) -> Result<()>
  where
    E: TaskExecutor + 'static,
  {
    self.start(executor).await?;
    self.wait_for_signal().await;
    self.shutdown().await
  }

  /// 关闭工作进程：停止领取，等待正在执行的任务，然后停止后台组件
  /// Shut the worker down: stop claiming, wait for in-flight tasks, then stop the background
  /// components
  pub async fn shutdown(&mut self) -> Result<()> {
    if self.state == WorkerState::Closed {
      return Ok(());
    }
    self.state = WorkerState::Closed;

    if let Some(mut processor) = self.processor.take() {
      processor.shutdown().await;
    }

    // 放弃尚未触发的延迟重试，由协调器补投
    // Abandon pending delayed retries; the reconciler picks them up
    self.shutdown.cancel();

    // 回收器可能正在执行回收的任务，同样等待它完成
    // The recoverer may be executing a reclaimed task; wait for it just the same
    for (component, handle) in self.components.drain(..) {
      component.shutdown();
      tokio::pin!(handle);
      while tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
        .await
        .is_err()
      {
        tracing::warn!(
          timeout = ?self.config.shutdown_timeout,
          "background component still busy after shutdown timeout, waiting"
        );
      }
    }

    tracing::info!(worker_id = %self.full_worker_id(), "worker stopped");
    Ok(())
  }

  /// 等待停止信号
  /// Wait for stop signal
  async fn wait_for_signal(&self) {
    let _ = signal::ctrl_c().await;
    tracing::info!("Received shutdown signal");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::executor_mux::ExecutorMux;
  use crate::memdb::memory_context;
  use std::time::Duration;

  #[tokio::test]
  async fn test_worker_rejects_invalid_config() {
    let (ctx, _queue, _store) = memory_context();
    let config = WorkerConfig {
      concurrency: 0,
      ..WorkerConfig::default()
    };
    assert!(Worker::new(ctx, config).is_err());
  }

  #[tokio::test]
  async fn test_worker_lifecycle() {
    let (ctx, _queue, _store) = memory_context();
    let mut worker = Worker::new(
      ctx,
      WorkerConfig::new()
        .concurrency(2)
        .block_timeout(Duration::from_millis(10)),
    )
    .unwrap();
    assert!(worker.full_worker_id().contains(':'));
    worker.ping().await.unwrap();

    worker.start(ExecutorMux::new()).await.unwrap();
    assert!(matches!(
      worker.start(ExecutorMux::new()).await,
      Err(Error::WorkerRunning)
    ));

    worker.shutdown().await.unwrap();
    assert!(matches!(
      worker.start(ExecutorMux::new()).await,
      Err(Error::WorkerClosed)
    ));
    assert_eq!(worker.active_workers(), 0);
  }
}
