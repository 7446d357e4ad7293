//! Recoverer 模块
//! Recoverer module
//!
//! 定期回收领取超时的条目（其消费者已崩溃或失联），并交给与正常领取相同的处理路径。
//! 记录上的终止状态检查保证原消费者恰好在超时后完成时不会重复提交。
//!
//! Periodically reclaims entries whose claim timed out (their consumer crashed or went silent)
//! and feeds them through the same handling path as a normal claim. The terminal-state check on
//! the record keeps a late-finishing original consumer from committing twice.

use crate::base::Context;
use crate::components::dispatcher::Dispatcher;
use crate::components::ComponentLifecycle;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Recoverer 配置
/// Recoverer configuration
#[derive(Debug, Clone)]
pub struct RecovererConfig {
  /// 回收间隔
  /// Reclaim interval
  pub interval: Duration,
  /// 领取超时
  /// Claim timeout
  pub claim_timeout: Duration,
  /// 每个主题每轮最多回收的条目数
  /// Maximum entries reclaimed per topic per pass
  pub batch_size: usize,
  /// 主题列表
  /// Topic list
  pub topics: Vec<String>,
  pub consumer_group: String,
  /// 回收后持有领取的消费者名称
  /// Consumer name that holds reclaimed entries
  pub consumer: String,
}

/// Recoverer - 负责回收失联消费者持有的条目
/// Recoverer - responsible for reclaiming entries held by lost consumers
pub struct Recoverer {
  ctx: Context,
  dispatcher: Arc<Dispatcher>,
  config: RecovererConfig,
  done: Arc<AtomicBool>,
  wake: Arc<Notify>,
}

impl Recoverer {
  /// 创建新的 Recoverer
  /// Create a new Recoverer
  pub fn new(ctx: Context, dispatcher: Arc<Dispatcher>, config: RecovererConfig) -> Self {
    Self {
      ctx,
      dispatcher,
      config,
      done: Arc::new(AtomicBool::new(false)),
      wake: Arc::new(Notify::new()),
    }
  }

  /// 启动 Recoverer
  /// Start the Recoverer
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      loop {
        tokio::select! {
          _ = interval.tick() => {}
          _ = self.wake.notified() => {}
        }

        if self.done.load(Ordering::Relaxed) {
          tracing::debug!("Recoverer: shutting down");
          break;
        }

        if let Err(e) = self.recover().await {
          tracing::error!("Recoverer error: {}", e);
        }
      }
    })
  }

  /// 执行一轮回收，返回处理的条目数
  /// Run one reclaim pass, returning the number of entries handled
  ///
  /// 每次只领取一个过期条目并处理完再领取下一个，未处理的条目不会在本消费者名下闲置。
  /// 每个主题最多处理 `batch_size` 个。
  ///
  /// Reclaims one stale entry at a time and finishes it before reclaiming the next, so no
  /// entry sits idle under this consumer. At most `batch_size` entries per topic.
  pub async fn recover(&self) -> Result<usize> {
    let mut handled = 0;
    for topic in &self.config.topics {
      for _ in 0..self.config.batch_size {
        if self.done.load(Ordering::Relaxed) {
          return Ok(handled);
        }
        let entry = match self
          .ctx
          .queue
          .reclaim_stale(
            topic,
            &self.config.consumer_group,
            &self.config.consumer,
            self.config.claim_timeout,
            1,
          )
          .await
        {
          Ok(mut entries) => match entries.pop() {
            Some(entry) => entry,
            None => break,
          },
          Err(e) => {
            tracing::warn!(
              "Recoverer: could not reclaim stale entries in topic {}: {}",
              topic,
              e
            );
            break;
          }
        };

        tracing::info!(
          task_id = %entry.task_id,
          entry_id = %entry.entry_id,
          delivery_count = entry.delivery_count,
          "Recoverer: redelivering stale entry"
        );
        match self
          .dispatcher
          .handle_entry(&entry, &self.config.consumer)
          .await
        {
          Ok(_) => handled += 1,
          Err(e) => tracing::warn!(
            task_id = %entry.task_id,
            "Recoverer: could not commit reclaimed entry: {}",
            e
          ),
        }
      }
    }
    Ok(handled)
  }

  /// 停止 Recoverer
  /// Stop the Recoverer
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

impl ComponentLifecycle for Recoverer {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Recoverer::start(self)
  }

  fn shutdown(&self) {
    Recoverer::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Recoverer::is_done(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::{DurableQueue, TaskStore};
  use crate::config::WorkerConfig;
  use crate::executor_mux::ExecutorMux;
  use crate::memdb::memory_context;
  use crate::task::{Task, TaskState};
  use serde_json::json;
  use tokio_util::sync::CancellationToken;

  const TOPIC: &str = "tasks:normal";

  fn recoverer_config(group: &str) -> RecovererConfig {
    RecovererConfig {
      interval: Duration::from_millis(10),
      claim_timeout: Duration::from_millis(20),
      batch_size: 10,
      topics: vec![TOPIC.to_string()],
      consumer_group: group.to_string(),
      consumer: "recoverer".to_string(),
    }
  }

  #[tokio::test]
  async fn test_recover_redelivers_crashed_claim() {
    let (ctx, queue, store) = memory_context();
    let config = WorkerConfig::new();
    queue.ensure_group(TOPIC, &config.consumer_group).await.unwrap();

    let mut mux = ExecutorMux::new();
    mux.handle_func("restaurant_booking", |_t: &Task| Ok(json!("booked")));
    let dispatcher = Arc::new(Dispatcher::new(
      ctx.clone(),
      Arc::new(mux),
      &config,
      CancellationToken::new(),
    ));

    let task = Task::new("restaurant_booking", json!({}), "u")
      .unwrap()
      .with_topic(TOPIC);
    store.insert(&task).await.unwrap();
    ctx.enqueue(TOPIC, &task.id).await.unwrap();

    // 消费者领取后崩溃，既没有执行也没有确认
    // The consumer crashes after claiming, neither executing nor acking
    queue
      .claim(TOPIC, &config.consumer_group, "crashed", 1, Duration::ZERO)
      .await
      .unwrap();

    let recoverer = Recoverer::new(ctx, dispatcher, recoverer_config(&config.consumer_group));
    assert_eq!(recoverer.recover().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(recoverer.recover().await.unwrap(), 1);

    let record = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts, 1);
  }

  #[tokio::test]
  async fn test_recover_claims_one_entry_at_a_time() {
    let (ctx, queue, store) = memory_context();
    let config = WorkerConfig::new();
    let group = config.consumer_group.clone();
    queue.ensure_group(TOPIC, &group).await.unwrap();

    // 执行期间记录回收器名下最多同时持有多少条目
    // Record the most entries held by the recoverer while one is executing
    let peak_held = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut mux = ExecutorMux::new();
    {
      let queue = queue.clone();
      let group = group.clone();
      let peak_held = peak_held.clone();
      mux.handle_async_func("restaurant_booking", move |_t: Task| {
        let queue = queue.clone();
        let group = group.clone();
        let peak_held = peak_held.clone();
        async move {
          let held = queue
            .pending_claims(TOPIC, &group)
            .await
            .into_iter()
            .filter(|(_, consumer, _)| consumer == "recoverer")
            .count();
          peak_held.fetch_max(held, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(30)).await;
          Ok(json!("booked"))
        }
      });
    }
    let dispatcher = Arc::new(Dispatcher::new(
      ctx.clone(),
      Arc::new(mux),
      &config,
      CancellationToken::new(),
    ));

    let mut ids = Vec::new();
    for _ in 0..3 {
      let task = Task::new("restaurant_booking", json!({}), "u")
        .unwrap()
        .with_topic(TOPIC);
      store.insert(&task).await.unwrap();
      ctx.enqueue(TOPIC, &task.id).await.unwrap();
      ids.push(task.id);
    }
    queue
      .claim(TOPIC, &group, "crashed", 3, Duration::ZERO)
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let recoverer = Recoverer::new(ctx, dispatcher, recoverer_config(&group));
    assert_eq!(recoverer.recover().await.unwrap(), 3);
    assert_eq!(peak_held.load(Ordering::SeqCst), 1);

    // 其余条目仍由崩溃的消费者持有，直到轮到它们
    // The rest stayed with the crashed consumer until their turn
    for id in &ids {
      let record = store.get(id).await.unwrap().unwrap();
      assert_eq!(record.state, TaskState::Completed);
      assert_eq!(record.attempts, 1);
    }
    assert!(queue.pending_claims(TOPIC, &group).await.is_empty());
  }

  #[tokio::test]
  async fn test_recoverer_shutdown() {
    let (ctx, _queue, _store) = memory_context();
    let dispatcher = Arc::new(Dispatcher::new(
      ctx.clone(),
      Arc::new(ExecutorMux::new()),
      &WorkerConfig::new(),
      CancellationToken::new(),
    ));
    let recoverer = Arc::new(Recoverer::new(
      ctx,
      dispatcher,
      recoverer_config("g"),
    ));

    assert!(!recoverer.is_done());
    let handle = recoverer.clone().start();
    recoverer.shutdown();
    assert!(recoverer.is_done());
    handle.await.unwrap();
  }
}
