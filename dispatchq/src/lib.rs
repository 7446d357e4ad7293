//! # dispatchq
//!
//! 可靠的任务分发核心：持久队列、生产者、消费者池、重试与死信策略
//!
//! Reliable task dispatch core: durable queue, producer, consumer pool, retry and dead-letter
//! policy.
//!
//! 任务记录保存业务状态，Redis Streams 保存投递状态。消费者先写记录再确认条目，
//! 因此崩溃、重复投递和重新领取都不会把任务执行成两个不同的终止结果。
//! Task records hold business state and Redis Streams holds delivery state. Consumers write the
//! record before acknowledging the entry, so crashes, redeliveries and reclaims never commit a
//! task to two different terminal outcomes.
//!
//! ## 特性
//! ## Features
//!
//! - 至少一次投递，终止状态至多提交一次
//!   - At-least-once delivery, terminal state committed at most once
//! - 按优先级划分的主题，支持严格优先级与加权轮询
//!   - Priority topics with strict or weighted polling
//! - 可重试失败按退避策略延迟重新入队，超过上限进入死信
//!   - Retryable failures are re-appended after a backoff, exceeding the ceiling dead-letters
//! - 回收崩溃消费者持有的条目，补投未入队的孤儿记录
//!   - Reclaims entries held by crashed consumers, re-appends orphaned records
//! - 死信检查与人工重放
//!   - Dead-letter inspection and manual replay
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use dispatchq::base::Context;
//! use dispatchq::config::WorkerConfig;
//! use dispatchq::executor_mux::ExecutorMux;
//! use dispatchq::producer::Producer;
//! use dispatchq::rdb::{RedisQueue, RedisTaskStore};
//! use dispatchq::redis::RedisConnectionConfig;
//! use dispatchq::task::IntentType;
//! use dispatchq::worker::Worker;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let redis = RedisConnectionConfig::from_url("redis://127.0.0.1:6379")?;
//!   let ctx = Context::new(
//!     Arc::new(RedisQueue::new(&redis).await?),
//!     Arc::new(RedisTaskStore::new(&redis).await?),
//!   );
//!
//!   // 提交任务
//!   // Submit a task
//!   let producer = Producer::new(ctx.clone());
//!   producer
//!     .submit_task(IntentType::MedicineReminder, json!({"pill": "vitamin d"}), "user-1")
//!     .await?;
//!
//!   // 运行工作进程直到 Ctrl-C
//!   // Run a worker until Ctrl-C
//!   let mut mux = ExecutorMux::new();
//!   mux.handle_func(IntentType::MedicineReminder, |_task| Ok(json!({"sent": true})));
//!   let mut worker = Worker::new(ctx, WorkerConfig::default())?;
//!   worker.run(mux).await?;
//!   Ok(())
//! }
//! ```

pub mod base;
pub mod components;
pub mod config;
pub mod error;
pub mod executor;
pub mod executor_mux;
pub mod inspector;
pub mod memdb;
#[cfg(feature = "postgres")]
pub mod pgdb;
pub mod policy;
pub mod producer;
pub mod rdb;
pub mod redis;
pub mod task;
pub mod worker;

pub use base::Context;
pub use error::{Error, Result};
pub use executor::{ExecuteError, ExecuteResult, TaskExecutor};
pub use task::{IntentType, Priority, Task, TaskState};
