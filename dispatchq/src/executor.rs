//! 任务执行器模块
//! Task executor module
//!
//! 核心只解释执行器的结果与错误约定，不关心执行本身做了什么。
//! The core only interprets the executor's result/error contract and is agnostic to what the
//! execution does.

use crate::error::Error;
use crate::policy::FailureKind;
use crate::task::Task;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

/// 执行结果
/// Execution result
pub type ExecuteResult = std::result::Result<serde_json::Value, ExecuteError>;

/// 执行失败分类
/// Execution failure classification
#[derive(Error, Debug)]
pub enum ExecuteError {
  /// 暂时性失败，按退避策略重试
  /// Transient failure, retried with back-off
  #[error("transient failure: {0}")]
  Transient(String),

  /// 永久性失败，不重试
  /// Permanent failure, never retried
  #[error("permanent failure: {0}")]
  Permanent(String),

  /// 未分类的失败，按暂时性处理
  /// Unclassified failure, treated as transient
  #[error("unclassified failure: {0}")]
  Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ExecuteError {
  pub fn transient<S: Into<String>>(message: S) -> Self {
    Self::Transient(message.into())
  }

  pub fn permanent<S: Into<String>>(message: S) -> Self {
    Self::Permanent(message.into())
  }

  /// 策略使用的失败类型
  /// Failure kind used by the policy
  pub fn kind(&self) -> FailureKind {
    match self {
      ExecuteError::Permanent(_) => FailureKind::Permanent,
      ExecuteError::Transient(_) | ExecuteError::Other(_) => FailureKind::Transient,
    }
  }
}

impl From<Error> for ExecuteError {
  fn from(err: Error) -> Self {
    match err {
      Error::Serialization(e) => ExecuteError::Permanent(format!("invalid payload: {e}")),
      e if e.is_retriable() => ExecuteError::Transient(e.to_string()),
      e => ExecuteError::Other(Box::new(e)),
    }
  }
}

impl From<serde_json::Error> for ExecuteError {
  fn from(err: serde_json::Error) -> Self {
    ExecuteError::Permanent(format!("invalid payload: {err}"))
  }
}

/// 任务执行器特性
/// Task executor trait
#[async_trait]
pub trait TaskExecutor: Send + Sync {
  /// 执行前校验负载；失败视为永久失败
  /// Validate the payload before execution; a failure is permanent
  fn validate(&self, _task: &Task) -> std::result::Result<(), ExecuteError> {
    Ok(())
  }

  /// 执行任务
  /// Execute the task
  async fn execute(&self, task: &Task) -> ExecuteResult;
}

/// 函数式执行器适配器
/// Functional executor adapter
pub struct ExecutorFunc<F> {
  func: F,
}

impl<F> ExecutorFunc<F>
where
  F: Fn(&Task) -> ExecuteResult + Send + Sync,
{
  /// 创建新的函数式执行器
  /// Create a new functional executor
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F> TaskExecutor for ExecutorFunc<F>
where
  F: Fn(&Task) -> ExecuteResult + Send + Sync,
{
  async fn execute(&self, task: &Task) -> ExecuteResult {
    (self.func)(task)
  }
}

/// 异步函数式执行器适配器
/// Asynchronous functional executor adapter
pub struct AsyncExecutorFunc<F> {
  func: F,
}

impl<F, Fut> AsyncExecutorFunc<F>
where
  F: Fn(Task) -> Fut + Send + Sync,
  Fut: Future<Output = ExecuteResult> + Send,
{
  /// 创建新的异步函数式执行器
  /// Create a new asynchronous functional executor
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

#[async_trait]
impl<F, Fut> TaskExecutor for AsyncExecutorFunc<F>
where
  F: Fn(Task) -> Fut + Send + Sync,
  Fut: Future<Output = ExecuteResult> + Send,
{
  async fn execute(&self, task: &Task) -> ExecuteResult {
    (self.func)(task.clone()).await
  }
}

/// 要求负载包含指定字段的执行器包装
/// Executor wrapper requiring the payload to carry the given fields
///
/// ```rust
/// use dispatchq::executor::{ExecutorFunc, RequireFields};
/// use serde_json::json;
///
/// let booking = RequireFields::new(
///   &["restaurant_name", "date", "time", "party_size"],
///   ExecutorFunc::new(|_task| Ok(json!({"status": "booked"}))),
/// );
/// # let _ = booking;
/// ```
pub struct RequireFields<E> {
  fields: Vec<String>,
  inner: E,
}

impl<E: TaskExecutor> RequireFields<E> {
  pub fn new(fields: &[&str], inner: E) -> Self {
    Self {
      fields: fields.iter().map(|f| f.to_string()).collect(),
      inner,
    }
  }
}

#[async_trait]
impl<E: TaskExecutor> TaskExecutor for RequireFields<E> {
  fn validate(&self, task: &Task) -> std::result::Result<(), ExecuteError> {
    let missing: Vec<&str> = self
      .fields
      .iter()
      .filter(|f| task.payload.get(f.as_str()).is_none_or(|v| v.is_null()))
      .map(String::as_str)
      .collect();
    if !missing.is_empty() {
      return Err(ExecuteError::permanent(format!(
        "missing required fields: {}",
        missing.join(", ")
      )));
    }
    self.inner.validate(task)
  }

  async fn execute(&self, task: &Task) -> ExecuteResult {
    self.inner.execute(task).await
  }
}
