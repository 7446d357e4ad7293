//! 任务模块
//! Task module
//!
//! 定义任务记录、任务状态机以及意图类型。
//! 状态转换方法不直接修改记录，而是返回版本号递增后的新记录，
//! 由调用方通过 [`TaskStore::compare_and_swap`](crate::base::TaskStore::compare_and_swap) 提交。
//!
//! Defines the task record, the task state machine and intent types.
//! Transition methods never mutate a record in place; they return a new record with a bumped
//! version which the caller commits through
//! [`TaskStore::compare_and_swap`](crate::base::TaskStore::compare_and_swap).
//!
//! ```text
//! PENDING ──begin──▶ IN_PROGRESS ──complete──▶ COMPLETED
//!    ▲                   │ │ │
//!    └──────retry────────┘ │ └──fail──▶ FAILED
//!                          └──dead_letter──▶ DEAD_LETTERED
//! ```

use crate::base::constants::DEFAULT_MAX_ATTEMPTS;
use crate::base::EntryId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 任务状态
/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  /// 等待被消费者领取（初始状态，也是可重试失败后的状态）
  /// Waiting to be claimed (initial state, also re-entered after a retryable failure)
  Pending,
  /// 正在被某个消费者执行
  /// Being executed by a consumer
  InProgress,
  /// 执行成功
  /// Executed successfully
  Completed,
  /// 永久失败
  /// Failed permanently
  Failed,
  /// 重试次数耗尽，等待人工处理
  /// Retry budget exhausted, awaiting manual remediation
  DeadLettered,
}

impl TaskState {
  /// 将任务状态转换为字符串
  /// Convert task state to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::InProgress => "in_progress",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::DeadLettered => "dead_lettered",
    }
  }

  /// 是否为终止状态
  /// Whether this is a terminal state
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::DeadLettered)
  }

  /// 状态机是否允许从当前状态转换到 `next`
  /// Whether the state machine allows moving from the current state to `next`
  ///
  /// `IN_PROGRESS -> IN_PROGRESS` 是回收后由新消费者接管。
  /// `PENDING -> DEAD_LETTERED` 仅在执行前已达到尝试上限时发生。
  ///
  /// `IN_PROGRESS -> IN_PROGRESS` is a takeover by a new consumer after reclaim.
  /// `PENDING -> DEAD_LETTERED` only happens when the attempt ceiling is reached before execution.
  pub fn can_transition_to(&self, next: TaskState) -> bool {
    use TaskState::*;
    matches!(
      (self, next),
      (Pending, InProgress)
        | (Pending, DeadLettered)
        | (InProgress, InProgress)
        | (InProgress, Completed)
        | (InProgress, Pending)
        | (InProgress, Failed)
        | (InProgress, DeadLettered)
    )
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskState {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "in_progress" => Ok(Self::InProgress),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      "dead_lettered" => Ok(Self::DeadLettered),
      other => Err(Error::store(format!("unknown task state: {other}"))),
    }
  }
}

/// 意图类型
/// Intent type
///
/// 已知意图有固定的标签；其他标签保留原样，由执行器注册表决定是否支持。
/// Known intents have fixed tags; any other tag is kept verbatim and the executor registry
/// decides whether it is supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentType {
  RestaurantBooking,
  SalonBooking,
  MedicineReminder,
  FamilyNotification,
  Custom(String),
}

impl IntentType {
  pub fn as_str(&self) -> &str {
    match self {
      Self::RestaurantBooking => "restaurant_booking",
      Self::SalonBooking => "salon_booking",
      Self::MedicineReminder => "medicine_reminder",
      Self::FamilyNotification => "family_notification",
      Self::Custom(tag) => tag,
    }
  }
}

impl From<&str> for IntentType {
  fn from(tag: &str) -> Self {
    match tag {
      "restaurant_booking" => Self::RestaurantBooking,
      "salon_booking" => Self::SalonBooking,
      "medicine_reminder" => Self::MedicineReminder,
      "family_notification" => Self::FamilyNotification,
      other => Self::Custom(other.to_string()),
    }
  }
}

impl From<String> for IntentType {
  fn from(tag: String) -> Self {
    IntentType::from(tag.as_str())
  }
}

impl From<IntentType> for String {
  fn from(intent: IntentType) -> Self {
    intent.as_str().to_string()
  }
}

impl fmt::Display for IntentType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 任务优先级，决定任务投递到哪个主题
/// Task priority, decides which topic the task is delivered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  High,
  #[default]
  Normal,
  Low,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::High => "high",
      Self::Normal => "normal",
      Self::Low => "low",
    }
  }
}

impl FromStr for Priority {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "high" => Ok(Self::High),
      "normal" => Ok(Self::Normal),
      "low" => Ok(Self::Low),
      other => Err(Error::config(format!("unknown priority: {other}"))),
    }
  }
}

/// 任务记录
/// Task record
///
/// 业务状态的唯一可信来源。`version` 在每次转换时递增，存储层以此实现比较并交换。
/// The source of truth for business state. `version` is bumped on every transition and the
/// store uses it for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub intent: IntentType,
  pub payload: serde_json::Value,
  pub user_id: String,
  pub priority: Priority,
  /// 投递所在的主题
  /// Topic the task is delivered on
  pub topic: String,
  pub state: TaskState,
  /// 已开始的执行次数
  /// Number of executions started
  pub attempts: u32,
  pub max_attempts: u32,
  pub result: Option<serde_json::Value>,
  pub last_error: Option<String>,
  /// 当前有效的队列条目
  /// Live queue entry, if any
  pub entry_id: Option<EntryId>,
  /// `IN_PROGRESS` 期间持有领取的消费者
  /// Consumer holding the claim while `IN_PROGRESS`
  pub consumer: Option<String>,
  /// 重试时最早的重新入队时间
  /// Earliest re-append time after a retry
  pub retry_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub version: u64,
}

impl Task {
  /// 创建新的 PENDING 任务
  /// Create a new PENDING task
  pub fn new<I, U>(intent: I, payload: serde_json::Value, user_id: U) -> Result<Self>
  where
    I: Into<IntentType>,
    U: AsRef<str>,
  {
    let intent = intent.into();
    if intent.as_str().trim().is_empty() {
      return Err(Error::InvalidIntent {
        intent: intent.as_str().to_string(),
      });
    }
    let now = Utc::now();
    Ok(Self {
      id: generate_task_id(),
      intent,
      payload,
      user_id: user_id.as_ref().to_string(),
      priority: Priority::Normal,
      topic: String::new(),
      state: TaskState::Pending,
      attempts: 0,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      result: None,
      last_error: None,
      entry_id: None,
      consumer: None,
      retry_at: None,
      created_at: now,
      updated_at: now,
      completed_at: None,
      version: 0,
    })
  }

  /// 从可序列化的负载创建任务
  /// Create a task from a serializable payload
  pub fn new_with_json<I, U, P>(intent: I, payload: &P, user_id: U) -> Result<Self>
  where
    I: Into<IntentType>,
    U: AsRef<str>,
    P: Serialize,
  {
    Self::new(intent, serde_json::to_value(payload)?, user_id)
  }

  pub fn with_id<T: AsRef<str>>(mut self, id: T) -> Self {
    self.id = id.as_ref().to_string();
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_topic<T: AsRef<str>>(mut self, topic: T) -> Self {
    self.topic = topic.as_ref().to_string();
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// 是否已达到尝试上限
  /// Whether the attempt ceiling has been reached
  pub fn attempts_exhausted(&self) -> bool {
    self.attempts >= self.max_attempts
  }

  /// 解析负载
  /// Decode the payload
  pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
    Ok(serde_json::from_value(self.payload.clone())?)
  }

  fn advance(&self, to: TaskState) -> Result<Task> {
    if !self.state.can_transition_to(to) {
      return Err(Error::InvalidTransition {
        id: self.id.clone(),
        from: self.state.as_str(),
        to: to.as_str(),
      });
    }
    let mut next = self.clone();
    next.state = to;
    next.updated_at = Utc::now();
    next.version = self.version + 1;
    if to.is_terminal() {
      next.completed_at = Some(next.updated_at);
      next.consumer = None;
    }
    Ok(next)
  }

  /// 记录已成功追加的队列条目
  /// Record the queue entry that was successfully appended
  pub fn attach_entry(&self, entry_id: EntryId) -> Result<Task> {
    if self.state != TaskState::Pending || self.entry_id.is_some() {
      return Err(Error::InvalidTransition {
        id: self.id.clone(),
        from: self.state.as_str(),
        to: TaskState::Pending.as_str(),
      });
    }
    let mut next = self.clone();
    next.entry_id = Some(entry_id);
    next.retry_at = None;
    next.updated_at = Utc::now();
    next.version = self.version + 1;
    Ok(next)
  }

  /// 开始一次执行：进入 IN_PROGRESS 并递增尝试次数
  /// Begin an execution: enter IN_PROGRESS and bump the attempt count
  pub fn begin(&self, entry_id: EntryId, consumer: &str) -> Result<Task> {
    if self.attempts_exhausted() {
      return Err(Error::InvalidTransition {
        id: self.id.clone(),
        from: self.state.as_str(),
        to: TaskState::InProgress.as_str(),
      });
    }
    let mut next = self.advance(TaskState::InProgress)?;
    next.attempts += 1;
    next.entry_id = Some(entry_id);
    next.consumer = Some(consumer.to_string());
    next.retry_at = None;
    Ok(next)
  }

  /// 执行成功
  /// Execution succeeded
  pub fn complete(&self, result: serde_json::Value) -> Result<Task> {
    let mut next = self.advance(TaskState::Completed)?;
    next.result = Some(result);
    Ok(next)
  }

  /// 可重试失败：回到 PENDING，等待在 `retry_at` 后重新入队
  /// Retryable failure: back to PENDING, waiting to be re-appended after `retry_at`
  pub fn retry(&self, error: &str, retry_at: DateTime<Utc>) -> Result<Task> {
    if self.state != TaskState::InProgress {
      return Err(Error::InvalidTransition {
        id: self.id.clone(),
        from: self.state.as_str(),
        to: TaskState::Pending.as_str(),
      });
    }
    let mut next = self.advance(TaskState::Pending)?;
    next.last_error = Some(error.to_string());
    next.entry_id = None;
    next.consumer = None;
    next.retry_at = Some(retry_at);
    Ok(next)
  }

  /// 永久失败
  /// Permanent failure
  pub fn fail(&self, error: &str) -> Result<Task> {
    let mut next = self.advance(TaskState::Failed)?;
    next.last_error = Some(error.to_string());
    Ok(next)
  }

  /// 进入死信
  /// Move to dead letter
  pub fn dead_letter(&self, reason: &str) -> Result<Task> {
    let mut next = self.advance(TaskState::DeadLettered)?;
    next.last_error = Some(reason.to_string());
    Ok(next)
  }

  /// 人工修复后重放死信任务：唯一离开终止状态的转换
  /// Replay a dead-lettered task after manual remediation: the only transition leaving a
  /// terminal state
  pub fn replay(&self) -> Result<Task> {
    if self.state != TaskState::DeadLettered {
      return Err(Error::InvalidTransition {
        id: self.id.clone(),
        from: self.state.as_str(),
        to: TaskState::Pending.as_str(),
      });
    }
    let mut next = self.clone();
    next.state = TaskState::Pending;
    next.attempts = 0;
    next.result = None;
    next.entry_id = None;
    next.consumer = None;
    next.retry_at = None;
    next.completed_at = None;
    next.updated_at = Utc::now();
    next.version = self.version + 1;
    Ok(next)
  }

  /// 协调器判定孤儿任务时使用的时间点
  /// Point in time the reconciler uses to decide whether the task is orphaned
  pub fn eligible_at(&self) -> DateTime<Utc> {
    self.retry_at.unwrap_or(self.updated_at)
  }

  /// 是否为等待入队的 PENDING 任务
  /// Whether the task is PENDING without a live queue entry
  pub fn is_unqueued(&self) -> bool {
    self.state == TaskState::Pending && self.entry_id.is_none()
  }
}

/// 生成任务 ID
/// Generate a task ID
pub fn generate_task_id() -> String {
  Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn entry(ms: u64) -> EntryId {
    EntryId::new(ms, 0)
  }

  #[test]
  fn test_task_creation() {
    let task = Task::new("restaurant_booking", json!({"party_size": 2}), "user-1").unwrap();
    assert_eq!(task.intent, IntentType::RestaurantBooking);
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(task.version, 0);
    assert!(task.is_unqueued());
  }

  #[test]
  fn test_task_empty_intent_rejected() {
    let err = Task::new("  ", json!({}), "user-1").unwrap_err();
    assert!(matches!(err, Error::InvalidIntent { .. }));
  }

  #[test]
  fn test_intent_round_trip_through_string() {
    assert_eq!(IntentType::from("salon_booking"), IntentType::SalonBooking);
    let custom = IntentType::from("pharmacy_order");
    assert_eq!(custom, IntentType::Custom("pharmacy_order".to_string()));
    assert_eq!(custom.to_string(), "pharmacy_order");

    let encoded = serde_json::to_string(&IntentType::MedicineReminder).unwrap();
    assert_eq!(encoded, "\"medicine_reminder\"");
  }

  #[test]
  fn test_task_state_strings() {
    for state in [
      TaskState::Pending,
      TaskState::InProgress,
      TaskState::Completed,
      TaskState::Failed,
      TaskState::DeadLettered,
    ] {
      assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
    }
    assert!("archived".parse::<TaskState>().is_err());
  }

  #[test]
  fn test_terminal_states_have_no_exits() {
    for terminal in [
      TaskState::Completed,
      TaskState::Failed,
      TaskState::DeadLettered,
    ] {
      assert!(terminal.is_terminal());
      for next in [
        TaskState::Pending,
        TaskState::InProgress,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::DeadLettered,
      ] {
        assert!(!terminal.can_transition_to(next));
      }
    }
  }

  #[test]
  fn test_begin_increments_attempts_and_version() {
    let task = Task::new("salon_booking", json!({}), "u").unwrap();
    let running = task.begin(entry(1), "worker-0").unwrap();
    assert_eq!(running.state, TaskState::InProgress);
    assert_eq!(running.attempts, 1);
    assert_eq!(running.version, 1);
    assert_eq!(running.consumer.as_deref(), Some("worker-0"));
    assert_eq!(running.entry_id, Some(entry(1)));
  }

  #[test]
  fn test_retry_clears_entry_and_keeps_attempts() {
    let task = Task::new("salon_booking", json!({}), "u").unwrap();
    let running = task.begin(entry(1), "w").unwrap();
    let retry_at = Utc::now();
    let pending = running.retry("timeout", retry_at).unwrap();
    assert_eq!(pending.state, TaskState::Pending);
    assert_eq!(pending.attempts, 1);
    assert_eq!(pending.entry_id, None);
    assert_eq!(pending.retry_at, Some(retry_at));
    assert_eq!(pending.last_error.as_deref(), Some("timeout"));
    assert_eq!(pending.eligible_at(), retry_at);
  }

  #[test]
  fn test_begin_refused_at_ceiling() {
    let task = Task::new("salon_booking", json!({}), "u")
      .unwrap()
      .with_max_attempts(1);
    let running = task.begin(entry(1), "w").unwrap();
    let err = running.begin(entry(1), "w2").unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
  }

  #[test]
  fn test_complete_is_terminal() {
    let task = Task::new("salon_booking", json!({}), "u").unwrap();
    let done = task
      .begin(entry(1), "w")
      .unwrap()
      .complete(json!({"confirmation": "ABC"}))
      .unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.consumer.is_none());
    assert!(done.begin(entry(2), "w").is_err());
    assert!(done.fail("late").is_err());
  }

  #[test]
  fn test_attach_entry_only_when_unqueued() {
    let task = Task::new("family_notification", json!({}), "u").unwrap();
    let queued = task.attach_entry(entry(5)).unwrap();
    assert_eq!(queued.entry_id, Some(entry(5)));
    assert!(queued.attach_entry(entry(6)).is_err());
  }

  #[test]
  fn test_replay_only_from_dead_letter() {
    let task = Task::new("medicine_reminder", json!({}), "u").unwrap();
    let dead = task
      .begin(entry(1), "w")
      .unwrap()
      .dead_letter("exhausted")
      .unwrap();
    let replayed = dead.replay().unwrap();
    assert_eq!(replayed.state, TaskState::Pending);
    assert_eq!(replayed.attempts, 0);
    assert_eq!(replayed.last_error.as_deref(), Some("exhausted"));
    assert!(replayed.completed_at.is_none());
    assert!(task.replay().is_err());
  }

  #[test]
  fn test_task_serde_round_trip() {
    let task = Task::new("restaurant_booking", json!({"time": "19:00"}), "u")
      .unwrap()
      .with_priority(Priority::High)
      .with_topic("tasks:high");
    let encoded = serde_json::to_string(&task).unwrap();
    let decoded: Task = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, task);
  }
}
