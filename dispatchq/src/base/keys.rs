//! Redis 键名
//! Redis key names
//!
//! 同一主题的流与死信流共享哈希标签 `{topic}`，因此可以在同一个事务中操作。
//! A topic's stream and its dead-letter stream share the `{topic}` hash tag, so both can be
//! touched in one transaction.

/// 所有键的前缀
/// Prefix of every key
pub const KEY_PREFIX: &str = "dispatchq";

/// 等待入队任务的索引（有序集合，分数为 `eligible_at` 毫秒）
/// Index of tasks awaiting an append (sorted set scored by `eligible_at` millis)
pub const UNQUEUED_INDEX: &str = "dispatchq:tasks:unqueued";

/// 已知主题集合
/// Set of known topics
pub const ALL_TOPICS: &str = "dispatchq:topics";

/// 主题键前缀
/// Topic key prefix
pub fn topic_key_prefix(topic: &str) -> String {
  format!("{KEY_PREFIX}:{{{topic}}}:")
}

/// 主题流
/// Topic stream
pub fn stream_key(topic: &str) -> String {
  format!("{}stream", topic_key_prefix(topic))
}

/// 主题的死信流
/// Dead-letter stream of a topic
pub fn dead_letter_key(topic: &str) -> String {
  format!("{}dead", topic_key_prefix(topic))
}

/// 任务记录
/// Task record
pub fn task_key(id: &str) -> String {
  format!("{KEY_PREFIX}:task:{id}")
}
