//! 检查器模块
//! Inspector module
//!
//! 提供给运维工具的检查与管理接口：查询任务、列出死信、重放死信、队列统计。
//! Inspection and management interface for operational tooling: look up tasks, list dead
//! letters, replay dead letters, queue statistics.

use crate::base::constants::{DEFAULT_CONSUMER_GROUP, TOPIC_HIGH, TOPIC_LOW, TOPIC_NORMAL};
use crate::base::{Context, DeadLetter, EntryId, QueueStats, TaskUpdate};
use crate::error::{Error, Result};
use crate::task::{Task, TaskState};

/// 检查器
/// Inspector
#[derive(Clone)]
pub struct Inspector {
  ctx: Context,
  topics: Vec<String>,
  consumer_group: String,
}

impl Inspector {
  /// 创建新的检查器，覆盖三个默认优先级主题
  /// Create a new inspector covering the three default priority topics
  pub fn new(ctx: Context) -> Self {
    Self {
      ctx,
      topics: vec![
        TOPIC_HIGH.to_string(),
        TOPIC_NORMAL.to_string(),
        TOPIC_LOW.to_string(),
      ],
      consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
    }
  }

  /// 设置检查的主题列表
  /// Set the topics to inspect
  pub fn with_topics<I, S>(mut self, topics: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.topics = topics.into_iter().map(Into::into).collect();
    self
  }

  /// 设置统计所用的消费者组
  /// Set the consumer group used for statistics
  pub fn with_consumer_group<S: Into<String>>(mut self, group: S) -> Self {
    self.consumer_group = group.into();
    self
  }

  pub fn topics(&self) -> &[String] {
    &self.topics
  }

  /// 获取任务记录
  /// Get a task record
  pub async fn get_task(&self, task_id: &str) -> Result<Task> {
    self
      .ctx
      .store
      .get(task_id)
      .await?
      .ok_or_else(|| Error::TaskNotFound {
        id: task_id.to_string(),
      })
  }

  /// 列出主题的死信
  /// List the dead letters of a topic
  pub async fn list_dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
    self.ctx.queue.list_dead_letters(topic).await
  }

  /// 在所有已知主题中查找死信
  /// Find a dead letter across every known topic
  pub async fn find_dead_letter(&self, entry_id: &EntryId) -> Result<Option<(String, DeadLetter)>> {
    for topic in &self.topics {
      if let Some(dead) = self.ctx.queue.get_dead_letter(topic, entry_id).await? {
        return Ok(Some((topic.clone(), dead)));
      }
    }
    Ok(None)
  }

  /// 重放死信，在所有已知主题中按 ID 查找
  /// Replay a dead letter, looked up by id across every known topic
  pub async fn replay_dead_letter(&self, entry_id: &EntryId) -> Result<EntryId> {
    let (topic, _) = self
      .find_dead_letter(entry_id)
      .await?
      .ok_or_else(|| Error::EntryNotFound {
        topic: self.topics.join(","),
        entry_id: entry_id.to_string(),
      })?;
    self.replay_dead_letter_in(&topic, entry_id).await
  }

  /// 重放指定主题中的死信，返回新条目 ID
  /// Replay a dead letter of the given topic, returning the new entry id
  ///
  /// 记录先回到 PENDING（尝试次数清零，保留最后的错误），再把条目移回主题。
  /// 若在两步之间中断，再次重放会从移回条目继续。
  /// The record moves back to PENDING first (attempts reset, last error kept), then the entry is
  /// moved back to the topic. If interrupted between the two steps, replaying again resumes at
  /// the move.
  ///
  /// 若协调器已在两步之间为记录追加了新条目，死信直接删除，返回那个条目。
  /// If the reconciler appended a fresh entry for the record in between, the dead letter is
  /// discarded and that entry is returned.
  pub async fn replay_dead_letter_in(&self, topic: &str, entry_id: &EntryId) -> Result<EntryId> {
    let dead = self
      .ctx
      .queue
      .get_dead_letter(topic, entry_id)
      .await?
      .ok_or_else(|| Error::EntryNotFound {
        topic: topic.to_string(),
        entry_id: entry_id.to_string(),
      })?;

    let requeued = |t: &Task| {
      t.state != TaskState::DeadLettered
        && t.entry_id.is_some()
        && t.entry_id != Some(dead.origin_entry_id)
    };
    let update = self
      .ctx
      .update_task(&dead.task_id, |current| match current.state {
        TaskState::DeadLettered => current.replay().map(Some),
        _ if current.is_unqueued() || requeued(current) => Ok(None),
        _ => Err(Error::InvalidTransition {
          id: current.id.clone(),
          from: current.state.as_str(),
          to: TaskState::Pending.as_str(),
        }),
      })
      .await?;

    if let TaskUpdate::Declined(current) = &update {
      if let (true, Some(live_id)) = (requeued(current), current.entry_id) {
        self.ctx.queue.discard_dead_letter(topic, entry_id).await?;
        tracing::info!(
          task_id = %dead.task_id,
          topic,
          dead_letter_id = %entry_id,
          entry_id = %live_id,
          "record already re-queued, dead letter discarded"
        );
        return Ok(live_id);
      }
    }

    let new_id = self.ctx.queue.replay_dead_letter(topic, entry_id).await?;
    if let Err(e) = self.ctx.attach_entry(&dead.task_id, new_id).await {
      tracing::warn!(
        task_id = %dead.task_id,
        entry_id = %new_id,
        error = %e,
        "replayed entry not attached, reconciler will resolve"
      );
    }

    tracing::info!(
      task_id = %dead.task_id,
      topic,
      dead_letter_id = %entry_id,
      entry_id = %new_id,
      "dead letter replayed"
    );
    Ok(new_id)
  }

  /// 获取主题统计
  /// Get topic statistics
  pub async fn queue_stats(&self, topic: &str) -> Result<QueueStats> {
    self.ctx.queue.stats(topic, &self.consumer_group).await
  }

  /// 获取所有已知主题的统计
  /// Get statistics of every known topic
  pub async fn all_queue_stats(&self) -> Result<Vec<QueueStats>> {
    let mut all = Vec::with_capacity(self.topics.len());
    for topic in &self.topics {
      all.push(self.queue_stats(topic).await?);
    }
    Ok(all)
  }
}
