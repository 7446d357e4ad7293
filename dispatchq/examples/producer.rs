//! 生产者示例
//! Producer example
//!
//! 演示如何提交不同意图和优先级的任务
//! Demonstrates submitting tasks of different intents and priorities

use dispatchq::config::ProducerConfig;
use dispatchq::error::Error;
use dispatchq::producer::Producer;
use dispatchq::rdb::redis_context;
use dispatchq::redis::RedisConnectionConfig;
use dispatchq::task::{IntentType, Priority};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct RestaurantBooking {
  restaurant_name: String,
  date: String,
  time: String,
  party_size: u32,
}

#[derive(Serialize, Deserialize)]
struct MedicineReminder {
  medicine: String,
  dose: String,
  time: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();

  // 优先从环境变量读取 Redis 地址
  // Read the Redis URL from the environment first
  let redis_url =
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
  println!("Using Redis URL: {redis_url}");
  let ctx = redis_context(&RedisConnectionConfig::from_url(&redis_url)?).await?;
  let producer = Producer::with_config(ctx, ProducerConfig::new().max_attempts(5))?;

  // 示例 1: 餐厅预订
  // Example 1: restaurant booking
  let booking = RestaurantBooking {
    restaurant_name: "Trattoria Luigi".to_string(),
    date: "2026-11-02".to_string(),
    time: "19:30".to_string(),
    party_size: 4,
  };
  let id = producer
    .submit_task(
      IntentType::RestaurantBooking,
      serde_json::to_value(&booking)?,
      "user-42",
    )
    .await?;
  println!("Submitted restaurant booking: {id}");

  // 示例 2: 高优先级的用药提醒
  // Example 2: a high-priority medicine reminder
  let reminder = MedicineReminder {
    medicine: "metformin".to_string(),
    dose: "500mg".to_string(),
    time: "08:00".to_string(),
  };
  match producer
    .submit_task_with_priority(
      IntentType::MedicineReminder,
      serde_json::to_value(&reminder)?,
      "user-42",
      Priority::High,
    )
    .await
  {
    Ok(id) => println!("Submitted medicine reminder: {id}"),
    // 记录已保存，协调器稍后会补投
    // The record is saved and the reconciler will append it later
    Err(Error::EnqueueDeferred { task_id, message }) => {
      println!("Reminder {task_id} stored, append deferred: {message}")
    }
    Err(e) => return Err(e.into()),
  }

  // 示例 3: 低优先级的家庭通知
  // Example 3: a low-priority family notification
  let id = producer
    .submit_task_with_priority(
      IntentType::FamilyNotification,
      serde_json::json!({"recipients": ["mom", "dad"], "message": "Dinner booked for Sunday"}),
      "user-42",
      Priority::Low,
    )
    .await?;
  println!("Submitted family notification: {id}");

  Ok(())
}
