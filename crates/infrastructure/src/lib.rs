//! 基础设施层实现。
//!
//! 提供 PostgreSQL 发件箱、数据库迁移以及过期记录清理任务。

pub mod migrations;
pub mod repository;
pub mod sweeper;

pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgOutbox};
pub use sweeper::spawn_expiry_sweeper;
