//! 配置模块
//! Configuration module
//!
//! 定义了工作进程与生产者的配置选项
//! Defines configuration options for the worker and the producer

use crate::base::constants::{
  DEFAULT_BLOCK_TIMEOUT, DEFAULT_CLAIM_TIMEOUT, DEFAULT_CONSUMER_GROUP, DEFAULT_EXECUTION_TIMEOUT,
  DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONCILE_GRACE, TOPIC_HIGH, TOPIC_LOW, TOPIC_NORMAL,
};
use crate::error::{Error, Result};
use crate::policy::BackoffPolicy;
use crate::task::Priority;
use std::collections::HashMap;
use std::time::Duration;

fn default_topics() -> HashMap<String, i32> {
  let mut topics = HashMap::new();
  topics.insert(TOPIC_HIGH.to_string(), 6);
  topics.insert(TOPIC_NORMAL.to_string(), 3);
  topics.insert(TOPIC_LOW.to_string(), 1);
  topics
}

fn validate_topic_name(name: &str) -> Result<()> {
  if name.trim().is_empty() || name.contains(['{', '}']) {
    return Err(Error::InvalidTopic {
      name: name.to_string(),
    });
  }
  Ok(())
}

/// 工作进程配置
/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// 并发消费者数量
  /// Number of concurrent consumers
  pub concurrency: usize,
  /// 主题配置，键为主题名称，值为优先级
  /// Topic configuration, key is topic name, value is priority
  pub topics: HashMap<String, i32>,
  /// 是否使用严格优先级
  /// Whether to use strict priority
  pub strict_priority: bool,
  /// 消费者组
  /// Consumer group
  pub consumer_group: String,
  /// 每次领取的最大条目数
  /// Maximum entries per claim
  pub batch_size: usize,
  /// 领取阻塞时间
  /// Claim block timeout
  pub block_timeout: Duration,
  /// 领取超时，超过后条目可被回收
  /// Claim timeout after which an entry may be reclaimed
  pub claim_timeout: Duration,
  /// 回收间隔
  /// Reclaim interval
  pub reclaim_interval: Duration,
  /// 每次回收的最大条目数
  /// Maximum entries per reclaim pass
  pub reclaim_batch: usize,
  /// 孤儿任务协调间隔
  /// Orphan reconciliation interval
  pub reconcile_interval: Duration,
  /// 孤儿任务宽限期
  /// Orphan grace period
  pub reconcile_grace: Duration,
  /// 每次协调的最大任务数
  /// Maximum tasks per reconciliation pass
  pub reconcile_batch: usize,
  /// 重试退避策略
  /// Retry back-off policy
  pub backoff: BackoffPolicy,
  /// 单次执行超时
  /// Per-execution timeout
  pub execution_timeout: Duration,
  /// 关闭超时时间
  /// Shutdown timeout
  pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: num_cpus::get(),
      topics: default_topics(),
      strict_priority: true,
      consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
      batch_size: 1,
      block_timeout: DEFAULT_BLOCK_TIMEOUT,
      claim_timeout: DEFAULT_CLAIM_TIMEOUT,
      reclaim_interval: Duration::from_secs(8),
      reclaim_batch: 100,
      reconcile_interval: Duration::from_secs(30),
      reconcile_grace: DEFAULT_RECONCILE_GRACE,
      reconcile_batch: 100,
      backoff: BackoffPolicy::default(),
      execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
      shutdown_timeout: Duration::from_secs(8),
    }
  }
}

impl WorkerConfig {
  /// 创建新的工作进程配置
  /// Create a new worker configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置并发数
  /// Set the number of concurrent consumers
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// 设置主题配置，空配置时回退到默认的三个优先级主题
  /// Set the topic configuration; an empty map falls back to the three default priority topics
  pub fn topics(mut self, topics: HashMap<String, i32>) -> Self {
    self.topics = if topics.is_empty() {
      default_topics()
    } else {
      topics
    };
    self
  }

  /// 添加主题
  /// Add a topic
  pub fn add_topic<S: AsRef<str>>(mut self, name: S, priority: i32) -> Result<Self> {
    let name = name.as_ref();
    validate_topic_name(name)?;
    if priority <= 0 {
      return Err(Error::config("Topic priority must be positive"));
    }
    self.topics.insert(name.to_string(), priority);
    Ok(self)
  }

  /// 设置严格优先级
  /// Set strict priority
  pub fn strict_priority(mut self, strict: bool) -> Self {
    self.strict_priority = strict;
    self
  }

  /// 设置消费者组
  /// Set the consumer group
  pub fn consumer_group<S: Into<String>>(mut self, group: S) -> Self {
    self.consumer_group = group.into();
    self
  }

  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size.max(1);
    self
  }

  pub fn block_timeout(mut self, timeout: Duration) -> Self {
    self.block_timeout = timeout;
    self
  }

  /// 设置领取超时
  /// Set the claim timeout
  pub fn claim_timeout(mut self, timeout: Duration) -> Self {
    self.claim_timeout = timeout;
    self
  }

  pub fn reclaim_interval(mut self, interval: Duration) -> Self {
    self.reclaim_interval = interval;
    self
  }

  pub fn reclaim_batch(mut self, batch: usize) -> Self {
    self.reclaim_batch = batch.max(1);
    self
  }

  pub fn reconcile_interval(mut self, interval: Duration) -> Self {
    self.reconcile_interval = interval;
    self
  }

  /// 设置孤儿任务宽限期
  /// Set the orphan grace period
  pub fn reconcile_grace(mut self, grace: Duration) -> Self {
    self.reconcile_grace = grace;
    self
  }

  pub fn reconcile_batch(mut self, batch: usize) -> Self {
    self.reconcile_batch = batch.max(1);
    self
  }

  /// 设置重试退避策略
  /// Set the retry back-off policy
  pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
    self.backoff = backoff;
    self
  }

  /// 设置单次执行超时
  /// Set the per-execution timeout
  pub fn execution_timeout(mut self, timeout: Duration) -> Self {
    self.execution_timeout = timeout;
    self
  }

  /// 设置关闭超时时间
  /// Set the shutdown timeout
  pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  /// 主题按优先级降序排列，同优先级按名称排序
  /// Topics in descending priority, ties broken by name
  pub fn ordered_topics(&self) -> Vec<String> {
    let mut topics: Vec<_> = self.topics.iter().collect();
    topics.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    topics.into_iter().map(|(name, _)| name.clone()).collect()
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.concurrency == 0 {
      return Err(Error::config("Concurrency must be greater than 0"));
    }

    if self.topics.is_empty() {
      return Err(Error::config("At least one topic must be configured"));
    }

    for (name, priority) in &self.topics {
      validate_topic_name(name)?;
      if *priority <= 0 {
        return Err(Error::config("Topic priority must be positive"));
      }
    }

    if self.consumer_group.trim().is_empty() {
      return Err(Error::config("Consumer group must not be empty"));
    }

    if self.batch_size == 0 || self.reclaim_batch == 0 || self.reconcile_batch == 0 {
      return Err(Error::config("Batch sizes must be greater than 0"));
    }

    if self.claim_timeout.is_zero() {
      return Err(Error::config("Claim timeout must be greater than 0"));
    }

    if self.execution_timeout.is_zero() {
      return Err(Error::config("Execution timeout must be greater than 0"));
    }

    if self.reclaim_interval.is_zero() || self.reconcile_interval.is_zero() {
      return Err(Error::config("Component intervals must be greater than 0"));
    }

    self.backoff.validate()
  }
}

/// 生产者配置
/// Producer configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
  /// 优先级到主题的映射
  /// Priority to topic mapping
  pub topics_by_priority: HashMap<Priority, String>,
  /// 写入每条新记录的最大尝试次数
  /// Maximum attempts stamped onto every new record
  pub max_attempts: u32,
}

impl Default for ProducerConfig {
  fn default() -> Self {
    let mut topics_by_priority = HashMap::new();
    topics_by_priority.insert(Priority::High, TOPIC_HIGH.to_string());
    topics_by_priority.insert(Priority::Normal, TOPIC_NORMAL.to_string());
    topics_by_priority.insert(Priority::Low, TOPIC_LOW.to_string());
    Self {
      topics_by_priority,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
    }
  }
}

impl ProducerConfig {
  /// 创建新的生产者配置
  /// Create a new producer configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置某个优先级对应的主题
  /// Set the topic for a priority
  pub fn topic<S: Into<String>>(mut self, priority: Priority, topic: S) -> Self {
    self.topics_by_priority.insert(priority, topic.into());
    self
  }

  /// 设置最大尝试次数
  /// Set the maximum attempts
  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  /// 优先级对应的主题，未配置时使用默认主题
  /// Topic for a priority, falling back to the default topic
  pub fn topic_for(&self, priority: Priority) -> &str {
    self
      .topics_by_priority
      .get(&priority)
      .map(String::as_str)
      .unwrap_or(TOPIC_NORMAL)
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.max_attempts == 0 {
      return Err(Error::config("Max attempts must be at least 1"));
    }
    for topic in self.topics_by_priority.values() {
      validate_topic_name(topic)?;
    }
    Ok(())
  }
}
