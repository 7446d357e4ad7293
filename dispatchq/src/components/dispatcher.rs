//! Dispatcher 模块
//! Dispatcher module
//!
//! 单个已领取条目的提交协议：
//! The commit protocol for a single claimed entry:
//!
//! 1. 读取记录并决定是否执行（终止状态或过期条目直接确认丢弃）
//!    Load the record and decide whether to run it (terminal records and stale entries are
//!    acked and dropped)
//! 2. 仅当本消费者当前持有领取时，比较并交换写入 IN_PROGRESS，尝试次数加一
//!    Only while this consumer currently holds the claim, compare-and-swap the record into
//!    IN_PROGRESS, bumping the attempt count
//! 3. 执行，期间周期性续期领取；捕获 panic 与超时
//!    Execute while periodically renewing the claim; panics and timeouts are caught
//! 4. 按策略写入结果状态，然后确认或移入死信
//!    Write the resulting state per the policy, then ack or dead-letter the entry
//!
//! 记录总是先于队列操作写入，崩溃后的重复投递会看到已提交的状态并只补做队列操作。
//! The record is always written before the queue operation, so a redelivery after a crash sees
//! the committed state and only redoes the queue side.

use crate::base::{Context, QueueEntry, TaskUpdate};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecuteError, ExecuteResult, TaskExecutor};
use crate::policy::{self, BackoffPolicy, Decision};
use crate::task::{Task, TaskState};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 消费者失联后尝试次数已用尽时写入的原因
/// Reason recorded when a consumer was lost on the final attempt
pub const EXHAUSTED_REASON: &str = "attempt ceiling reached after consumer loss";

/// 记录缺失时写入死信的原因
/// Reason recorded when the entry references a missing record
pub const MISSING_RECORD_REASON: &str = "task record not found";

/// 单个条目的处理结果
/// Outcome of handling a single entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
  /// 执行成功
  /// Execution succeeded
  Completed,
  /// 暂时性失败，将在延迟后重新入队
  /// Transient failure, re-appended after the delay
  Retrying(Duration),
  /// 永久失败
  /// Permanent failure
  Failed,
  /// 进入死信
  /// Dead-lettered
  DeadLettered,
  /// 重复投递或过期条目，已确认但未执行
  /// Redelivery or stale entry, acked without executing
  Duplicate,
  /// 领取已属于其他消费者，本消费者没有提交任何状态
  /// The claim belongs to another consumer; nothing was committed by this one
  Superseded,
  /// 条目引用的记录不存在
  /// The entry references a missing record
  Missing,
}

enum Admission {
  Run,
  Exhausted,
  Skip,
}

fn admission(current: &Task, entry: &QueueEntry) -> Admission {
  if current.state.is_terminal() {
    return Admission::Skip;
  }
  if let Some(live) = current.entry_id {
    if live != entry.entry_id {
      return Admission::Skip;
    }
  }
  if current.attempts_exhausted() {
    Admission::Exhausted
  } else {
    Admission::Run
  }
}

fn owns(current: &Task, entry: &QueueEntry, consumer: &str) -> bool {
  current.state == TaskState::InProgress
    && current.entry_id == Some(entry.entry_id)
    && current.consumer.as_deref() == Some(consumer)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "executor panicked".to_string()
  }
}

/// Dispatcher - 把一个条目驱动到提交
/// Dispatcher - drives a single entry to commit
pub struct Dispatcher {
  ctx: Context,
  executor: Arc<dyn TaskExecutor>,
  group: String,
  backoff: BackoffPolicy,
  execution_timeout: Duration,
  lease_interval: Duration,
  shutdown: CancellationToken,
}

impl Dispatcher {
  /// 创建新的 Dispatcher
  /// Create a new Dispatcher
  pub fn new(
    ctx: Context,
    executor: Arc<dyn TaskExecutor>,
    config: &WorkerConfig,
    shutdown: CancellationToken,
  ) -> Self {
    let lease_interval = (config.claim_timeout / 3).max(Duration::from_millis(10));
    Self {
      ctx,
      executor,
      group: config.consumer_group.clone(),
      backoff: config.backoff.clone(),
      execution_timeout: config.execution_timeout,
      lease_interval,
      shutdown,
    }
  }

  /// 处理一个已领取的条目
  /// Handle one claimed entry
  ///
  /// 返回错误表示基础设施故障；条目保持领取状态，由回收流程再次投递。
  /// An error means an infrastructure failure; the entry stays claimed and is redelivered by
  /// the reclaim pass.
  pub async fn handle_entry(&self, entry: &QueueEntry, consumer: &str) -> Result<DispatchOutcome> {
    // 续期同时确认领取仍属于本消费者，并重置空闲时间
    // Renewing both confirms the claim is still ours and resets its idle time
    let holds_claim = self
      .ctx
      .queue
      .extend_claim(&entry.topic, &self.group, consumer, &entry.entry_id)
      .await?;

    let admitted = self
      .ctx
      .update_task(&entry.task_id, |current| match admission(current, entry) {
        Admission::Skip => Ok(None),
        _ if !holds_claim => Ok(None),
        Admission::Run => current.begin(entry.entry_id, consumer).map(Some),
        Admission::Exhausted => current.dead_letter(EXHAUSTED_REASON).map(Some),
      })
      .await;

    let task = match admitted {
      Ok(TaskUpdate::Applied(task)) if task.state == TaskState::InProgress => task,
      Ok(TaskUpdate::Applied(task)) => {
        tracing::warn!(
          task_id = %task.id,
          entry_id = %entry.entry_id,
          attempts = task.attempts,
          "attempts exhausted before execution, dead-lettering"
        );
        self.ctx.queue.dead_letter(&self.group, entry, EXHAUSTED_REASON).await?;
        return Ok(DispatchOutcome::DeadLettered);
      }
      Ok(TaskUpdate::Declined(task)) => {
        if matches!(admission(&task, entry), Admission::Skip) {
          self.settle_skipped(entry, &task).await?;
          return Ok(DispatchOutcome::Duplicate);
        }
        tracing::warn!(
          task_id = %task.id,
          entry_id = %entry.entry_id,
          consumer,
          owner = ?task.consumer,
          "claim no longer held, leaving entry to its current owner"
        );
        return Ok(DispatchOutcome::Superseded);
      }
      Err(Error::TaskNotFound { .. }) => {
        tracing::error!(
          task_id = %entry.task_id,
          entry_id = %entry.entry_id,
          topic = %entry.topic,
          "entry references a missing task record"
        );
        self
          .ctx
          .queue
          .dead_letter(&self.group, entry, MISSING_RECORD_REASON)
          .await?;
        return Ok(DispatchOutcome::Missing);
      }
      Err(e) => return Err(e),
    };

    tracing::debug!(
      task_id = %task.id,
      entry_id = %entry.entry_id,
      consumer,
      attempts = task.attempts,
      "task execution started"
    );

    let result = self.run(&task, entry, consumer).await;
    self.commit(&task, entry, consumer, result).await
  }

  /// 已终止或过期的条目：补做队列操作
  /// Terminal or stale entry: redo the queue side only
  async fn settle_skipped(&self, entry: &QueueEntry, current: &Task) -> Result<()> {
    if current.state == TaskState::DeadLettered && current.entry_id == Some(entry.entry_id) {
      let reason = current.last_error.as_deref().unwrap_or(EXHAUSTED_REASON);
      self.ctx.queue.dead_letter(&self.group, entry, reason).await?;
      return Ok(());
    }
    tracing::debug!(
      task_id = %current.id,
      entry_id = %entry.entry_id,
      state = %current.state,
      "dropping duplicate entry"
    );
    self
      .ctx
      .queue
      .ack(&entry.topic, &self.group, &entry.entry_id)
      .await?;
    Ok(())
  }

  /// 校验并执行，期间续期领取
  /// Validate and execute, renewing the claim meanwhile
  async fn run(&self, task: &Task, entry: &QueueEntry, consumer: &str) -> ExecuteResult {
    match std::panic::catch_unwind(AssertUnwindSafe(|| self.executor.validate(task))) {
      Ok(validated) => validated?,
      Err(panic) => {
        let message = panic_message(panic.as_ref());
        tracing::error!(task_id = %task.id, panic = %message, "executor panicked during validation");
        return Err(ExecuteError::Other(message.into()));
      }
    }

    let execution = AssertUnwindSafe(self.executor.execute(task)).catch_unwind();
    let execution = tokio::time::timeout(self.execution_timeout, execution);
    tokio::pin!(execution);

    let mut lease = tokio::time::interval(self.lease_interval);
    lease.tick().await;

    let finished = loop {
      tokio::select! {
        finished = &mut execution => break finished,
        _ = lease.tick() => {
          match self
            .ctx
            .queue
            .extend_claim(&entry.topic, &self.group, consumer, &entry.entry_id)
            .await
          {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
              task_id = %task.id,
              entry_id = %entry.entry_id,
              "claim no longer held while executing"
            ),
            Err(e) => tracing::warn!(
              task_id = %task.id,
              error = %e,
              "could not extend claim"
            ),
          }
        }
      }
    };

    match finished {
      Ok(Ok(result)) => result,
      Ok(Err(panic)) => {
        let message = panic_message(panic.as_ref());
        tracing::error!(task_id = %task.id, panic = %message, "executor panicked");
        Err(ExecuteError::Other(message.into()))
      }
      Err(_) => Err(ExecuteError::transient(format!(
        "execution timed out after {:?}",
        self.execution_timeout
      ))),
    }
  }

  /// 写入结果状态，然后确认、重新入队或移入死信
  /// Write the resulting state, then ack, re-append or dead-letter
  async fn commit(
    &self,
    task: &Task,
    entry: &QueueEntry,
    consumer: &str,
    result: ExecuteResult,
  ) -> Result<DispatchOutcome> {
    let (decision, error) = match result {
      Ok(value) => {
        let update = self
          .ctx
          .update_task(&task.id, |current| {
            if owns(current, entry, consumer) {
              current.complete(value.clone()).map(Some)
            } else {
              Ok(None)
            }
          })
          .await?;
        if !update.is_applied() {
          return Ok(self.superseded(task, entry));
        }
        self
          .ctx
          .queue
          .ack(&entry.topic, &self.group, &entry.entry_id)
          .await?;
        tracing::info!(task_id = %task.id, attempts = task.attempts, "task completed");
        return Ok(DispatchOutcome::Completed);
      }
      Err(e) => {
        let decision = policy::decide(task.attempts, e.kind(), task.max_attempts, &self.backoff);
        (decision, e.to_string())
      }
    };

    match decision {
      Decision::RetryAfter(delay) => {
        let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let update = self
          .ctx
          .update_task(&task.id, |current| {
            if owns(current, entry, consumer) {
              current.retry(&error, retry_at).map(Some)
            } else {
              Ok(None)
            }
          })
          .await?;
        if !update.is_applied() {
          return Ok(self.superseded(task, entry));
        }
        self
          .ctx
          .queue
          .ack(&entry.topic, &self.group, &entry.entry_id)
          .await?;
        tracing::warn!(
          task_id = %task.id,
          attempts = task.attempts,
          delay = ?delay,
          error = %error,
          "task failed, retrying"
        );
        self.schedule_requeue(task.topic.clone(), task.id.clone(), delay);
        Ok(DispatchOutcome::Retrying(delay))
      }
      Decision::FailPermanently => {
        let update = self
          .ctx
          .update_task(&task.id, |current| {
            if owns(current, entry, consumer) {
              current.fail(&error).map(Some)
            } else {
              Ok(None)
            }
          })
          .await?;
        if !update.is_applied() {
          return Ok(self.superseded(task, entry));
        }
        self
          .ctx
          .queue
          .ack(&entry.topic, &self.group, &entry.entry_id)
          .await?;
        tracing::error!(task_id = %task.id, error = %error, "task failed permanently");
        Ok(DispatchOutcome::Failed)
      }
      Decision::DeadLetter => {
        let update = self
          .ctx
          .update_task(&task.id, |current| {
            if owns(current, entry, consumer) {
              current.dead_letter(&error).map(Some)
            } else {
              Ok(None)
            }
          })
          .await?;
        if !update.is_applied() {
          return Ok(self.superseded(task, entry));
        }
        let dead_id = self.ctx.queue.dead_letter(&self.group, entry, &error).await?;
        tracing::error!(
          task_id = %task.id,
          attempts = task.attempts,
          dead_letter_id = %dead_id,
          error = %error,
          "task dead-lettered"
        );
        Ok(DispatchOutcome::DeadLettered)
      }
    }
  }

  fn superseded(&self, task: &Task, entry: &QueueEntry) -> DispatchOutcome {
    tracing::warn!(
      task_id = %task.id,
      entry_id = %entry.entry_id,
      "task was taken over during execution, discarding result"
    );
    DispatchOutcome::Superseded
  }

  /// 延迟后重新追加条目；关闭时放弃，由协调器补投
  /// Re-append after the delay; abandoned on shutdown and left to the reconciler
  fn schedule_requeue(&self, topic: String, task_id: String, delay: Duration) {
    let ctx = self.ctx.clone();
    let shutdown = self.shutdown.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.cancelled() => {
          tracing::debug!(task_id = %task_id, "shutdown before retry re-append");
          return;
        }
      }
      match ctx.enqueue(&topic, &task_id).await {
        Ok(entry_id) => {
          tracing::debug!(task_id = %task_id, entry_id = %entry_id, "task re-appended for retry")
        }
        Err(e) => tracing::warn!(
          task_id = %task_id,
          error = %e,
          "retry re-append failed, left for reconciliation"
        ),
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::{DurableQueue, TaskStore};
  use crate::executor_mux::ExecutorMux;
  use crate::memdb::{memory_context, MemoryQueue, MemoryStore};
  use serde_json::json;

  const TOPIC: &str = "tasks:normal";

  struct Harness {
    ctx: Context,
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    config: WorkerConfig,
  }

  async fn harness() -> Harness {
    let (ctx, queue, store) = memory_context();
    let config = WorkerConfig::new().backoff(BackoffPolicy::Fixed(Duration::from_millis(10)));
    queue.ensure_group(TOPIC, &config.consumer_group).await.unwrap();
    Harness {
      ctx,
      queue,
      store,
      config,
    }
  }

  impl Harness {
    fn dispatcher(&self, mux: ExecutorMux) -> Dispatcher {
      Dispatcher::new(
        self.ctx.clone(),
        Arc::new(mux),
        &self.config,
        CancellationToken::new(),
      )
    }

    async fn submit(&self, intent: &str, max_attempts: u32) -> Task {
      let task = Task::new(intent, json!({"n": 1}), "user-1")
        .unwrap()
        .with_topic(TOPIC)
        .with_max_attempts(max_attempts);
      self.store.insert(&task).await.unwrap();
      self.ctx.enqueue(TOPIC, &task.id).await.unwrap();
      task
    }

    async fn claim_one(&self, consumer: &str) -> QueueEntry {
      let mut entries = self
        .queue
        .claim(TOPIC, &self.config.consumer_group, consumer, 1, Duration::from_secs(1))
        .await
        .unwrap();
      assert_eq!(entries.len(), 1);
      entries.remove(0)
    }

    async fn record(&self, id: &str) -> Task {
      self.store.get(id).await.unwrap().unwrap()
    }
  }

  #[tokio::test]
  async fn test_success_completes_and_acks() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("restaurant_booking", |_t: &Task| Ok(json!({"booking": "B-1"})));
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("restaurant_booking", 3).await;
    let entry = h.claim_one("w1").await;
    let outcome = dispatcher.handle_entry(&entry, "w1").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.result, Some(json!({"booking": "B-1"})));
    assert!(h
      .queue
      .pending_claims(TOPIC, &h.config.consumer_group)
      .await
      .is_empty());
  }

  #[tokio::test]
  async fn test_permanent_failure_is_not_retried() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("salon_booking", |_t: &Task| {
      Err(ExecuteError::permanent("salon does not exist"))
    });
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("salon_booking", 3).await;
    let entry = h.claim_one("w1").await;
    let outcome = dispatcher.handle_entry(&entry, "w1").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Failed);

    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::Failed);
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.unwrap().contains("salon does not exist"));
    assert!(h.queue.list_dead_letters(TOPIC).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_transient_failure_retries_then_dead_letters() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("family_notification", |_t: &Task| {
      Err(ExecuteError::transient("sms gateway unavailable"))
    });
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("family_notification", 2).await;

    let entry = h.claim_one("w1").await;
    let outcome = dispatcher.handle_entry(&entry, "w1").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Retrying(Duration::from_millis(10)));
    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::Pending);
    assert!(record.retry_at.is_some());

    // 延迟后重新追加的条目
    // The entry re-appended after the delay
    let entry = h.claim_one("w1").await;
    let outcome = dispatcher.handle_entry(&entry, "w1").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::DeadLettered);

    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::DeadLettered);
    assert_eq!(record.attempts, 2);
    let dead = h.queue.list_dead_letters(TOPIC).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, task.id);
    assert!(dead[0].reason.contains("sms gateway unavailable"));
  }

  #[tokio::test]
  async fn test_panic_is_treated_as_transient() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("medicine_reminder", |_t: &Task| -> ExecuteResult {
      panic!("reminder service exploded")
    });
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("medicine_reminder", 1).await;
    let entry = h.claim_one("w1").await;
    let outcome = dispatcher.handle_entry(&entry, "w1").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::DeadLettered);
    let record = h.record(&task.id).await;
    assert!(record
      .last_error
      .unwrap()
      .contains("reminder service exploded"));
  }

  #[tokio::test]
  async fn test_execution_timeout_is_transient() {
    let mut h = harness().await;
    h.config = h.config.clone().execution_timeout(Duration::from_millis(20));
    let mut mux = ExecutorMux::new();
    mux.handle_async_func("salon_booking", |_t: Task| async move {
      tokio::time::sleep(Duration::from_secs(5)).await;
      Ok(json!(null))
    });
    let dispatcher = h.dispatcher(mux);

    h.submit("salon_booking", 3).await;
    let entry = h.claim_one("w1").await;
    let outcome = dispatcher.handle_entry(&entry, "w1").await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Retrying(_)));
  }

  #[tokio::test]
  async fn test_validation_failure_is_permanent() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle(
      "restaurant_booking",
      crate::executor::RequireFields::new(
        &["restaurant", "party_size"],
        crate::executor::ExecutorFunc::new(|_t: &Task| Ok(json!("booked"))),
      ),
    );
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("restaurant_booking", 3).await;
    let entry = h.claim_one("w1").await;
    assert_eq!(
      dispatcher.handle_entry(&entry, "w1").await.unwrap(),
      DispatchOutcome::Failed
    );
    assert_eq!(h.record(&task.id).await.attempts, 1);
  }

  #[tokio::test]
  async fn test_terminal_redelivery_is_acked_without_execution() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("restaurant_booking", |_t: &Task| Ok(json!("ok")));
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("restaurant_booking", 3).await;
    let entry = h.claim_one("w1").await;
    dispatcher.handle_entry(&entry, "w1").await.unwrap();

    let again = dispatcher.handle_entry(&entry, "w2").await.unwrap();
    assert_eq!(again, DispatchOutcome::Duplicate);
    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts, 1);
  }

  #[tokio::test]
  async fn test_stale_entry_is_dropped() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("restaurant_booking", |_t: &Task| Ok(json!("ok")));
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("restaurant_booking", 3).await;
    // 第二个条目不会被登记到记录上
    // The second entry is not attached to the record
    h.ctx.enqueue(TOPIC, &task.id).await.unwrap();

    let first = h.claim_one("w1").await;
    let second = h.claim_one("w1").await;
    assert_eq!(
      dispatcher.handle_entry(&second, "w1").await.unwrap(),
      DispatchOutcome::Duplicate
    );
    assert_eq!(
      dispatcher.handle_entry(&first, "w1").await.unwrap(),
      DispatchOutcome::Completed
    );
    assert_eq!(h.record(&task.id).await.attempts, 1);
  }

  #[tokio::test]
  async fn test_takeover_on_final_attempt_dead_letters() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle_func("restaurant_booking", |_t: &Task| Ok(json!("ok")));
    let dispatcher = h.dispatcher(mux);

    let task = h.submit("restaurant_booking", 1).await;
    let entry = h.claim_one("crashed").await;
    // 模拟消费者在执行中崩溃
    // Simulate a consumer crashing mid-execution
    h.ctx
      .update_task(&task.id, |t| t.begin(entry.entry_id, "crashed").map(Some))
      .await
      .unwrap();

    let reclaimed = h
      .queue
      .reclaim_stale(TOPIC, &h.config.consumer_group, "rescuer", Duration::ZERO, 10)
      .await
      .unwrap();
    assert_eq!(reclaimed.len(), 1);

    let outcome = dispatcher.handle_entry(&reclaimed[0], "rescuer").await.unwrap();
    assert_eq!(outcome, DispatchOutcome::DeadLettered);
    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::DeadLettered);
    assert_eq!(record.attempts, 1);
  }

  #[tokio::test]
  async fn test_consumer_without_claim_does_not_take_over() {
    let h = harness().await;
    let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut mux = ExecutorMux::new();
    {
      let (running, peak, calls) = (running.clone(), peak.clone(), calls.clone());
      mux.handle_async_func("salon_booking", move |_t: Task| {
        let (running, peak, calls) = (running.clone(), peak.clone(), calls.clone());
        async move {
          calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
          let now = running.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
          peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(200)).await;
          running.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
          Ok(json!("booked"))
        }
      });
    }
    let dispatcher = Arc::new(h.dispatcher(mux));

    let task = h.submit("salon_booking", 3).await;
    let entry = h.claim_one("c0").await;

    // c0 的领取过期后被回收，回收方开始执行
    // c0's claim goes stale and is reclaimed; the rescuer starts executing
    tokio::time::sleep(Duration::from_millis(20)).await;
    let reclaimed = h
      .queue
      .reclaim_stale(TOPIC, &h.config.consumer_group, "rescuer", Duration::from_millis(10), 10)
      .await
      .unwrap();
    assert_eq!(reclaimed.len(), 1);
    let rescuer = {
      let dispatcher = dispatcher.clone();
      let entry = reclaimed[0].clone();
      tokio::spawn(async move { dispatcher.handle_entry(&entry, "rescuer").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // c0 随后处理批次中的同一条目
    // c0 then reaches the same entry in its batch
    assert_eq!(
      dispatcher.handle_entry(&entry, "c0").await.unwrap(),
      DispatchOutcome::Superseded
    );
    assert_eq!(
      rescuer.await.unwrap().unwrap(),
      DispatchOutcome::Completed
    );

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.attempts, 1);
    assert!(h
      .queue
      .pending_claims(TOPIC, &h.config.consumer_group)
      .await
      .is_empty());
  }

  struct PanickingValidator;

  #[async_trait::async_trait]
  impl TaskExecutor for PanickingValidator {
    fn validate(&self, task: &Task) -> std::result::Result<(), ExecuteError> {
      let party_size = task.payload["party_size"].as_u64().unwrap();
      assert!(party_size > 0);
      Ok(())
    }

    async fn execute(&self, _task: &Task) -> ExecuteResult {
      Ok(json!("booked"))
    }
  }

  #[tokio::test]
  async fn test_panicking_validation_is_contained() {
    let h = harness().await;
    let mut mux = ExecutorMux::new();
    mux.handle("restaurant_booking", PanickingValidator);
    let dispatcher = Arc::new(h.dispatcher(mux));

    let task = h.submit("restaurant_booking", 1).await;
    let entry = h.claim_one("w1").await;
    let joined = {
      let dispatcher = dispatcher.clone();
      tokio::spawn(async move { dispatcher.handle_entry(&entry, "w1").await }).await
    };
    let outcome = joined.expect("dispatcher task should not panic").unwrap();
    assert_eq!(outcome, DispatchOutcome::DeadLettered);

    let record = h.record(&task.id).await;
    assert_eq!(record.state, TaskState::DeadLettered);
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.is_some());
  }

  #[tokio::test]
  async fn test_missing_record_is_dead_lettered() {
    let h = harness().await;
    let dispatcher = h.dispatcher(ExecutorMux::new());
    h.queue.append(TOPIC, "ghost").await.unwrap();
    let entry = h.claim_one("w1").await;
    assert_eq!(
      dispatcher.handle_entry(&entry, "w1").await.unwrap(),
      DispatchOutcome::Missing
    );
    let dead = h.queue.list_dead_letters(TOPIC).await.unwrap();
    assert_eq!(dead[0].reason, MISSING_RECORD_REASON);
  }
}
