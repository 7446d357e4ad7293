//! ExecutorMux - 执行器注册表
//! ExecutorMux - Executor registry
//!
//! 在启动时把意图标签映射到执行器实现，运行时按任务意图分派。
//! 未注册的意图按永久失败处理，而不是让工作进程崩溃。
//!
//! Maps intent tags to executor implementations at startup and dispatches on the task's intent
//! at runtime. Unregistered intents are classified as permanent failures rather than crashing the
//! worker.
//!
//! ## Examples / 示例
//!
//! ```rust
//! use dispatchq::executor::{ExecuteError, ExecuteResult};
//! use dispatchq::executor_mux::ExecutorMux;
//! use dispatchq::task::{IntentType, Task};
//! use serde_json::json;
//!
//! let mut mux = ExecutorMux::new();
//!
//! mux.handle_func(IntentType::MedicineReminder, |task: &Task| -> ExecuteResult {
//!   Ok(json!({"scheduled_for": task.payload["time"]}))
//! });
//!
//! mux.handle_async_func(IntentType::SalonBooking, |_task: Task| async move {
//!   Err(ExecuteError::transient("salon provider unavailable"))
//! });
//!
//! assert!(mux.supports(&IntentType::SalonBooking));
//! assert!(!mux.supports(&IntentType::FamilyNotification));
//! ```

use crate::executor::{AsyncExecutorFunc, ExecuteError, ExecuteResult, ExecutorFunc, TaskExecutor};
use crate::task::{IntentType, Task};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// ExecutorMux - 按意图分派的执行器注册表
/// ExecutorMux - registry dispatching on intent
#[derive(Default)]
pub struct ExecutorMux {
  executors: HashMap<IntentType, Arc<dyn TaskExecutor>>,
}

impl ExecutorMux {
  /// 创建新的 ExecutorMux
  /// Create a new ExecutorMux
  pub fn new() -> Self {
    Self {
      executors: HashMap::new(),
    }
  }

  /// 注册执行器，同一意图重复注册时后者覆盖前者
  /// Register an executor; a later registration for the same intent replaces the earlier one
  pub fn handle<I, E>(&mut self, intent: I, executor: E) -> &mut Self
  where
    I: Into<IntentType>,
    E: TaskExecutor + 'static,
  {
    self.handle_arc(intent, Arc::new(executor))
  }

  /// 注册共享的执行器
  /// Register a shared executor
  pub fn handle_arc<I>(&mut self, intent: I, executor: Arc<dyn TaskExecutor>) -> &mut Self
  where
    I: Into<IntentType>,
  {
    let intent = intent.into();
    if self.executors.insert(intent.clone(), executor).is_some() {
      tracing::warn!(intent = %intent, "executor replaced for intent");
    }
    self
  }

  /// 注册同步执行函数
  /// Register a synchronous executor function
  pub fn handle_func<I, F>(&mut self, intent: I, func: F) -> &mut Self
  where
    I: Into<IntentType>,
    F: Fn(&Task) -> ExecuteResult + Send + Sync + 'static,
  {
    self.handle(intent, ExecutorFunc::new(func))
  }

  /// 注册异步执行函数
  /// Register an asynchronous executor function
  pub fn handle_async_func<I, F, Fut>(&mut self, intent: I, func: F) -> &mut Self
  where
    I: Into<IntentType>,
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecuteResult> + Send + 'static,
  {
    self.handle(intent, AsyncExecutorFunc::new(func))
  }

  /// 是否注册了该意图
  /// Whether the intent is registered
  pub fn supports(&self, intent: &IntentType) -> bool {
    self.executors.contains_key(intent)
  }

  /// 已注册的意图
  /// Registered intents
  pub fn intents(&self) -> Vec<IntentType> {
    let mut intents: Vec<_> = self.executors.keys().cloned().collect();
    intents.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    intents
  }

  fn find(&self, intent: &IntentType) -> std::result::Result<&Arc<dyn TaskExecutor>, ExecuteError> {
    self
      .executors
      .get(intent)
      .ok_or_else(|| ExecuteError::permanent(format!("no executor registered for intent: {intent}")))
  }
}

#[async_trait]
impl TaskExecutor for ExecutorMux {
  fn validate(&self, task: &Task) -> std::result::Result<(), ExecuteError> {
    self.find(&task.intent)?.validate(task)
  }

  async fn execute(&self, task: &Task) -> ExecuteResult {
    self.find(&task.intent)?.execute(task).await
  }
}
