//! SQLx SQLite 连接池初始化与健康检查
//!
//! 防重放记录保存在本地 sqlite 文件中（按节点/应用身份各自一个文件），进程重启后仍然有效。
//!
//! 用法：
//! let pool = init_sqlite_pool("./data/owtp_cache.db").await?;
//! health_check(&pool).await?;

use std::{path::Path, str::FromStr, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

pub type SqlitePool = sqlx::Pool<sqlx::Sqlite>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS owtp_nonces (
    nonce INTEGER PRIMARY KEY NOT NULL,
    first_seen INTEGER NOT NULL
)";

const SCHEMA_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_owtp_nonces_first_seen ON owtp_nonces (first_seen)";

/// 初始化 sqlite 连接池（文件不存在则创建）
pub async fn init_sqlite_pool(cache_file: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(cache_file).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(cache_file)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .map_err(|e| {
            tracing::error!(cache_file = %cache_file, "Failed to open replay cache: {}", e);
            e
        })?;

    migrate(&pool).await?;
    health_check(&pool).await?;

    Ok(pool)
}

/// 内存数据库（测试用），单连接保证所有查询看到同一个库
pub async fn init_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// 建表（幂等）
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA).execute(pool).await?;
    sqlx::query(SCHEMA_INDEX).execute(pool).await?;
    Ok(())
}

pub async fn health_check(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_creates_parent_dirs_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let pool = init_sqlite_pool(path.to_str().unwrap()).await.unwrap();

        assert!(path.exists());
        // 二次建表不报错
        migrate(&pool).await.unwrap();
        health_check(&pool).await.unwrap();
    }
}
