use std::time::Duration;

/// 高优先级主题
pub const TOPIC_HIGH: &str = "tasks:high";
/// 普通优先级主题
pub const TOPIC_NORMAL: &str = "tasks:normal";
/// 低优先级主题
pub const TOPIC_LOW: &str = "tasks:low";

/// 默认消费者组
pub const DEFAULT_CONSUMER_GROUP: &str = "ai_agent_workers";

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// 领取阻塞等待时间
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);
/// 领取超时，超过后可被其他消费者回收
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);
/// 默认执行超时时间
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30 * 60); // 30 分钟
/// 孤儿任务宽限期
pub const DEFAULT_RECONCILE_GRACE: Duration = Duration::from_secs(60);

/// 比较并交换冲突时的最大重试次数
pub const CAS_RETRIES: usize = 8;

/// 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
