//! 预导入模块
//! Prelude module

pub use super::tasks::Entity as Tasks;
