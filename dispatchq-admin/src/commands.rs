//! Subcommand implementations. Each returns the JSON value printed by `main`.

use anyhow::Context as _;
use dispatchq::base::EntryId;
use dispatchq::inspector::Inspector;
use dispatchq::rdb::redis_context;
use dispatchq::redis::RedisConnectionConfig;
use serde_json::{json, Value};

/// Connect to Redis and build an inspector over the given consumer group.
pub async fn connect(redis_url: &str, group: &str) -> anyhow::Result<Inspector> {
  let config = RedisConnectionConfig::from_url(redis_url).context("invalid REDIS_URL")?;
  let ctx = redis_context(&config)
    .await
    .with_context(|| format!("could not connect to {redis_url}"))?;
  Ok(Inspector::new(ctx).with_consumer_group(group))
}

pub async fn task(inspector: &Inspector, id: &str) -> anyhow::Result<Value> {
  let task = inspector.get_task(id).await?;
  Ok(serde_json::to_value(task)?)
}

pub async fn dead_letters(inspector: &Inspector, topic: &str) -> anyhow::Result<Value> {
  let dead = inspector.list_dead_letters(topic).await?;
  Ok(json!({ "topic": topic, "count": dead.len(), "dead_letters": dead }))
}

pub async fn replay(inspector: &Inspector, topic: &str, entry_id: &str) -> anyhow::Result<Value> {
  let dead_id: EntryId = entry_id
    .parse()
    .with_context(|| format!("malformed entry id {entry_id}"))?;
  let new_id = inspector.replay_dead_letter_in(topic, &dead_id).await?;
  tracing::info!(topic, dead_letter_id = %dead_id, entry_id = %new_id, "replayed");
  Ok(json!({ "topic": topic, "replayed": dead_id, "entry_id": new_id }))
}

pub async fn stats(inspector: &Inspector, topic: Option<&str>) -> anyhow::Result<Value> {
  match topic {
    Some(topic) => Ok(serde_json::to_value(inspector.queue_stats(topic).await?)?),
    None => Ok(serde_json::to_value(inspector.all_queue_stats().await?)?),
  }
}
