//! PostgreSQL 任务记录存储
//! PostgreSQL task record store
//!
//! 比较并交换是一条带 `version` 条件的 UPDATE，受影响行数为 0 即版本冲突。
//! Compare-and-swap is a single UPDATE conditioned on `version`; zero affected rows means a
//! version conflict.

use crate::base::TaskStore;
use crate::error::{Error, Result};
use crate::pgdb::entity::{tasks, Tasks};
use crate::task::{Task, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
  ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
  QueryFilter, QueryOrder, QuerySelect, Schema, Set,
};

const INDEX_STATEMENTS: [&str; 2] = [
  "CREATE INDEX IF NOT EXISTS idx_dispatchq_tasks_unqueued \
   ON dispatchq_tasks(eligible_at) WHERE state = 'pending' AND entry_id IS NULL",
  "CREATE INDEX IF NOT EXISTS idx_dispatchq_tasks_user_id ON dispatchq_tasks(user_id)",
];

/// PostgreSQL 任务记录存储
/// PostgreSQL task record store
pub struct PostgresTaskStore {
  db: DatabaseConnection,
}

impl PostgresTaskStore {
  /// 从连接字符串创建，并初始化表结构
  /// Create from a connection string and initialize the schema
  pub async fn new(database_url: &str) -> Result<Self> {
    let opt = ConnectOptions::new(database_url)
      .max_connections(10)
      .to_owned();
    let db = Database::connect(opt).await?;
    let store = Self { db };
    store.init_schema().await?;
    Ok(store)
  }

  /// 从现有数据库连接创建
  /// Create from an existing database connection
  pub fn from_connection(db: DatabaseConnection) -> Self {
    Self { db }
  }

  pub fn db(&self) -> &DatabaseConnection {
    &self.db
  }

  /// 初始化数据库 schema
  /// Initialize database schema
  pub async fn init_schema(&self) -> Result<()> {
    let backend = self.db.get_database_backend();
    let schema = Schema::new(backend);

    let mut stmt = schema.create_table_from_entity(Tasks);
    stmt.if_not_exists();
    self.db.execute(backend.build(&stmt)).await?;

    // 预备语句只能包含一条命令，索引逐条创建
    // A prepared statement carries a single command, so indexes are created one at a time
    for index_sql in INDEX_STATEMENTS {
      self.db.execute_unprepared(index_sql).await?;
    }
    Ok(())
  }

  fn to_active_model(task: &Task) -> Result<tasks::ActiveModel> {
    Ok(tasks::ActiveModel {
      id: Set(task.id.clone()),
      intent: Set(task.intent.as_str().to_string()),
      user_id: Set(task.user_id.clone()),
      topic: Set(task.topic.clone()),
      state: Set(task.state.into()),
      attempts: Set(task.attempts as i32),
      max_attempts: Set(task.max_attempts as i32),
      entry_id: Set(task.entry_id.map(|id| id.to_string())),
      eligible_at: Set(task.eligible_at().into()),
      version: Set(task.version as i64),
      data: Set(serde_json::to_value(task)?),
      created_at: Set(task.created_at.into()),
      updated_at: Set(task.updated_at.into()),
    })
  }

  fn from_model(model: tasks::Model) -> Result<Task> {
    Ok(serde_json::from_value(model.data)?)
  }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
  async fn ping(&self) -> Result<()> {
    self.db.ping().await?;
    Ok(())
  }

  async fn insert(&self, task: &Task) -> Result<()> {
    let inserted = Tasks::insert(Self::to_active_model(task)?)
      .on_conflict(
        OnConflict::column(tasks::Column::Id)
          .do_nothing()
          .to_owned(),
      )
      .exec_without_returning(&self.db)
      .await?;
    if inserted == 0 {
      return Err(Error::TaskExists {
        id: task.id.clone(),
      });
    }
    Ok(())
  }

  async fn get(&self, id: &str) -> Result<Option<Task>> {
    Tasks::find_by_id(id)
      .one(&self.db)
      .await?
      .map(Self::from_model)
      .transpose()
  }

  async fn compare_and_swap(&self, expected_version: u64, task: &Task) -> Result<bool> {
    let result = Tasks::update_many()
      .set(Self::to_active_model(task)?)
      .filter(tasks::Column::Id.eq(task.id.as_str()))
      .filter(tasks::Column::Version.eq(expected_version as i64))
      .exec(&self.db)
      .await?;
    if result.rows_affected > 0 {
      return Ok(true);
    }
    match Tasks::find_by_id(task.id.as_str()).one(&self.db).await? {
      Some(_) => Ok(false),
      None => Err(Error::TaskNotFound {
        id: task.id.clone(),
      }),
    }
  }

  async fn list_unqueued(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
    let models = Tasks::find()
      .filter(tasks::Column::State.eq(tasks::TaskState::from(TaskState::Pending)))
      .filter(tasks::Column::EntryId.is_null())
      .filter(tasks::Column::EligibleAt.lte(cutoff))
      .order_by_asc(tasks::Column::EligibleAt)
      .limit(limit as u64)
      .all(&self.db)
      .await?;
    models.into_iter().map(Self::from_model).collect()
  }
}
