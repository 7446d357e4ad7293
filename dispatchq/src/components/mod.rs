//! Lifecycle 模块
//! Lifecycle module
//!
//! 提供通用的组件生命周期管理 trait
//! Provides a common trait for component lifecycle management
//!
//! 此模块定义了统一的生命周期接口，用于管理各种后台组件（如 Recoverer、Reconciler 等）
//! This module defines a unified lifecycle interface for managing background components
//! (such as the Recoverer and the Reconciler)

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod dispatcher;
pub mod processor;
pub mod reconciler;
pub mod recoverer;

/// Lifecycle trait - 组件生命周期管理接口
/// Lifecycle trait - Component lifecycle management interface
///
/// # 实现者 / Implementors
///
/// - [`Recoverer`](recoverer::Recoverer) - 回收失联消费者持有的条目
/// - [`Reconciler`](reconciler::Reconciler) - 为未入队的孤儿任务重新追加条目
///
/// # 注意 / Note
///
/// [`Processor`](processor::Processor) 没有实现此 trait：它管理一组消费者循环，
/// `start()` 接受 `&mut self`，`shutdown()` 是异步的并等待正在执行的任务。
/// [`Processor`](processor::Processor) does not implement this trait: it owns a pool of consumer
/// loops, `start()` takes `&mut self` and `shutdown()` is async, waiting for in-flight tasks.
///
/// # 示例 / Example
///
/// ```rust
/// use dispatchq::components::ComponentLifecycle;
/// use dispatchq::components::reconciler::{Reconciler, ReconcilerConfig};
/// use dispatchq::memdb::memory_context;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let (ctx, _queue, _store) = memory_context();
/// let reconciler = Arc::new(Reconciler::new(ctx, ReconcilerConfig::default()));
///
/// // 启动组件
/// // Start component
/// let handle = reconciler.clone().start();
/// assert!(!reconciler.is_done());
///
/// // 关闭组件
/// // Shutdown component
/// reconciler.shutdown();
/// assert!(reconciler.is_done());
/// handle.abort();
/// # }
/// ```
pub trait ComponentLifecycle {
  /// 启动组件，返回用于等待后台任务结束的 JoinHandle
  /// Start the component, returning a JoinHandle to wait for its background task
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 发送关闭信号，组件在完成当前操作后停止
  /// Send the shutdown signal; the component stops after its current operation
  fn shutdown(&self);

  /// 组件是否已停止
  /// Whether the component has stopped
  fn is_done(&self) -> bool;
}
