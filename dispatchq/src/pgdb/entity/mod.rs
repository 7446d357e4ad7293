//! 数据库实体模块
//! Database entity module

pub mod prelude;
pub mod tasks;

pub use prelude::*;
