//! 任务实体
//! Task entity

use sea_orm::entity::prelude::*;

/// 任务状态枚举
/// Task state enum
#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum TaskState {
  #[sea_orm(string_value = "pending")]
  Pending,
  #[sea_orm(string_value = "in_progress")]
  InProgress,
  #[sea_orm(string_value = "completed")]
  Completed,
  #[sea_orm(string_value = "failed")]
  Failed,
  #[sea_orm(string_value = "dead_lettered")]
  DeadLettered,
}

impl From<crate::task::TaskState> for TaskState {
  fn from(state: crate::task::TaskState) -> Self {
    match state {
      crate::task::TaskState::Pending => Self::Pending,
      crate::task::TaskState::InProgress => Self::InProgress,
      crate::task::TaskState::Completed => Self::Completed,
      crate::task::TaskState::Failed => Self::Failed,
      crate::task::TaskState::DeadLettered => Self::DeadLettered,
    }
  }
}

/// 任务实体模型
/// Task entity model
///
/// 完整记录保存在 `data` 中；其余列用于查询和比较并交换。
/// The full record lives in `data`; the other columns serve queries and compare-and-swap.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "dispatchq_tasks")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub id: String,
  pub intent: String,
  pub user_id: String,
  pub topic: String,
  pub state: TaskState,
  pub attempts: i32,
  pub max_attempts: i32,
  pub entry_id: Option<String>,
  pub eligible_at: DateTimeWithTimeZone,
  pub version: i64,
  pub data: Json,
  pub created_at: DateTimeWithTimeZone,
  pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
