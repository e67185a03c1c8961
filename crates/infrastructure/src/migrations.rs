use sqlx::migrate::Migrator;

/// 工作区根目录 `migrations/` 下的迁移脚本
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
