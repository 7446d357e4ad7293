//! PostgreSQL 记录存储模块
//! PostgreSQL record store module
//!
//! 使用 SeaORM 保存任务记录，需要 `postgres` feature。队列仍然是 Redis Streams。
//! Stores task records with SeaORM, behind the `postgres` feature. The queue is still Redis
//! Streams.

pub mod entity;
pub mod postgres_store;

pub use entity::*;
pub use postgres_store::PostgresTaskStore;
