//! 内存后端模块
//! Memory backend module
//!
//! 基于内存的队列与任务存储实现，不依赖任何外部服务
//! In-memory queue and task store implementations without any external service dependencies

pub mod memory_queue;
pub mod memory_store;

pub use memory_queue::MemoryQueue;
pub use memory_store::MemoryStore;

use crate::base::Context;
use std::sync::Arc;

/// 创建基于内存后端的 [`Context`]，同时返回具体类型以便检查内部状态
/// Build a memory-backed [`Context`], also returning the concrete handles for inspection
pub fn memory_context() -> (Context, Arc<MemoryQueue>, Arc<MemoryStore>) {
  let queue = Arc::new(MemoryQueue::new());
  let store = Arc::new(MemoryStore::new());
  let context = Context::new(queue.clone(), store.clone());
  (context, queue, store)
}
