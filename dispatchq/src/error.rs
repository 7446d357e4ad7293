//! 错误处理模块
//! Error handling module
//!
//! 定义了基础设施层（队列、存储、配置）使用的错误类型。
//! 执行器返回的业务失败分类见 [`crate::executor::ExecuteError`]。
//!
//! Defines the error types used by the infrastructure layer (queue, store, configuration).
//! Business failures returned by executors are classified by [`crate::executor::ExecuteError`].

use thiserror::Error;

/// dispatchq 库的结果类型
/// Result type for the dispatchq library
pub type Result<T> = std::result::Result<T, Error>;

/// dispatchq 错误类型
/// dispatchq error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis connection error: {0}")]
  Redis(#[from] redis::RedisError),

  #[cfg(feature = "postgres")]
  /// SeaORM 数据库错误
  /// SeaORM database error
  #[error("SeaORM database error: {0}")]
  SeaOrm(#[from] sea_orm::DbErr),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// 任务已存在
  /// Task already exists
  #[error("Task already exists: {id}")]
  TaskExists { id: String },

  /// 任务未找到错误
  /// Task not found error
  #[error("Task not found: {id}")]
  TaskNotFound { id: String },

  /// 队列条目未找到
  /// Queue entry not found
  #[error("Entry not found: {entry_id} in {topic}")]
  EntryNotFound { topic: String, entry_id: String },

  /// 非法的状态转换
  /// Illegal state transition
  #[error("Invalid transition for task {id}: {from} -> {to}")]
  InvalidTransition {
    id: String,
    from: &'static str,
    to: &'static str,
  },

  /// 任务记录已写入，但入队失败；由协调器负责补偿
  /// Task record was stored but the append failed; the reconciler will re-append it
  #[error("Task {task_id} stored but not enqueued: {message}")]
  EnqueueDeferred { task_id: String, message: String },

  /// 队列错误
  /// Queue error
  #[error("Queue error: {message}")]
  Queue { message: String },

  /// 存储错误
  /// Store error
  #[error("Store error: {message}")]
  Store { message: String },

  /// 无效的主题名称
  /// Invalid topic name
  #[error("Invalid topic name: {name}")]
  InvalidTopic { name: String },

  /// 无效的条目 ID
  /// Invalid entry id
  #[error("Invalid entry id: {0}")]
  InvalidEntryId(String),

  /// 无效的意图类型
  /// Invalid intent type
  #[error("Invalid intent type: {intent}")]
  InvalidIntent { intent: String },

  /// Worker 已在运行
  /// Worker is already running
  #[error("Worker is already running")]
  WorkerRunning,

  /// Worker 已关闭
  /// Worker closed
  #[error("Worker closed")]
  WorkerClosed,

  /// 超时错误
  /// Timeout error
  #[error("Operation timeout")]
  Timeout,

  /// 取消错误
  /// Cancellation error
  #[error("Operation cancelled")]
  Cancelled,

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建队列错误
  /// Create a queue error
  pub fn queue<S: Into<String>>(message: S) -> Self {
    Self::Queue {
      message: message.into(),
    }
  }

  /// 创建存储错误
  /// Create a store error
  pub fn store<S: Into<String>>(message: S) -> Self {
    Self::Store {
      message: message.into(),
    }
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 检查是否为可重试的基础设施错误
  /// Check if the error is a retriable infrastructure error
  pub fn is_retriable(&self) -> bool {
    match self {
      Error::Redis(e) => {
        e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_connection_refusal()
      }
      #[cfg(feature = "postgres")]
      Error::SeaOrm(sea_orm::DbErr::Conn(_)) | Error::SeaOrm(sea_orm::DbErr::ConnectionAcquire(_)) => {
        true
      }
      Error::Io(_) | Error::Timeout | Error::EnqueueDeferred { .. } => true,
      _ => false,
    }
  }

  /// 检查是否为致命错误
  /// Check if the error is fatal
  pub fn is_fatal(&self) -> bool {
    !self.is_retriable()
  }
}
