//! 消费者示例
//! Consumer example
//!
//! 演示如何注册执行器并运行工作进程
//! Demonstrates registering executors and running a worker

use async_trait::async_trait;
use dispatchq::config::WorkerConfig;
use dispatchq::executor::{ExecuteError, ExecuteResult, RequireFields, TaskExecutor};
use dispatchq::executor_mux::ExecutorMux;
use dispatchq::rdb::redis_context;
use dispatchq::redis::RedisConnectionConfig;
use dispatchq::task::{IntentType, Task};
use dispatchq::worker::Worker;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Deserialize)]
struct RestaurantBooking {
  restaurant_name: String,
  date: String,
  time: String,
  party_size: u32,
}

/// 餐厅预订执行器
/// Restaurant booking executor
struct RestaurantExecutor;

#[async_trait]
impl TaskExecutor for RestaurantExecutor {
  async fn execute(&self, task: &Task) -> ExecuteResult {
    let booking: RestaurantBooking = task.payload_as()?;
    if booking.party_size == 0 || booking.party_size > 20 {
      return Err(ExecuteError::permanent(format!(
        "party size {} not accepted",
        booking.party_size
      )));
    }
    println!(
      "Booking {} for {} on {} at {}",
      booking.restaurant_name, booking.party_size, booking.date, booking.time
    );

    // 模拟调用预订服务
    // Simulate a call to the booking provider
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(json!({"confirmation": format!("R-{}", &task.id[..8])}))
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter("dispatchq=debug,consumer=info")
    .init();

  let redis_url =
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
  let ctx = redis_context(&RedisConnectionConfig::from_url(&redis_url)?).await?;

  let mut mux = ExecutorMux::new();
  mux.handle(
    IntentType::RestaurantBooking,
    RequireFields::new(
      &["restaurant_name", "date", "time", "party_size"],
      RestaurantExecutor,
    ),
  );
  mux.handle_func(IntentType::MedicineReminder, |task: &Task| {
    println!("Reminder for {}: {}", task.user_id, task.payload);
    Ok(json!({"sent": true}))
  });
  mux.handle_async_func(IntentType::FamilyNotification, |task: Task| async move {
    // 短信网关偶尔不可用，交给重试策略处理
    // The SMS gateway is occasionally unavailable; the retry policy handles it
    if rand::random::<f64>() < 0.3 {
      return Err(ExecuteError::transient("sms gateway unavailable"));
    }
    println!("Notified family of {}", task.user_id);
    Ok(json!({"delivered": true}))
  });

  let config = WorkerConfig::new()
    .concurrency(4)
    .execution_timeout(Duration::from_secs(60));
  let mut worker = Worker::new(ctx, config)?;
  worker.run(mux).await?;
  Ok(())
}
