//! 防重放记录
//!
//! 记录已接受的入站请求 nonce（nonce -> 首次接收时间）。
//! `check_and_insert` 是单一原子步骤：同一 nonce 的两次并发投递只有一次能通过。

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{error::Result, infrastructure::db::SqlitePool};

#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// 首次出现返回 true 并记录；已记录返回 false
    async fn check_and_insert(&self, nonce: u64, seen_at: i64) -> Result<bool>;

    async fn contains(&self, nonce: u64) -> Result<bool>;

    /// 删除 first_seen 早于 cutoff（unix 秒）的记录，返回删除条数
    async fn evict_older_than(&self, cutoff: i64) -> Result<u64>;

    async fn len(&self) -> Result<u64>;
}

// sqlite INTEGER 为有符号 64 位，按位转换保证 u64 全范围可逆
fn to_key(nonce: u64) -> i64 {
    nonce as i64
}

/// sqlite 持久化实现
pub struct SqliteReplayGuard {
    pool: SqlitePool,
}

impl SqliteReplayGuard {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(cache_file: &str) -> Result<Self> {
        let pool = crate::infrastructure::db::init_sqlite_pool(cache_file).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ReplayGuard for SqliteReplayGuard {
    async fn check_and_insert(&self, nonce: u64, seen_at: i64) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO owtp_nonces (nonce, first_seen) VALUES (?1, ?2)")
            .bind(to_key(nonce))
            .bind(seen_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn contains(&self, nonce: u64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT first_seen FROM owtp_nonces WHERE nonce = ?1")
            .bind(to_key(nonce))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn evict_older_than(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM owtp_nonces WHERE first_seen < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn len(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM owtp_nonces")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

/// 内存实现（测试与临时节点）
#[derive(Default)]
pub struct MemoryReplayGuard {
    seen: Mutex<HashMap<u64, i64>>,
}

impl MemoryReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashMap<u64, i64>> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ReplayGuard for MemoryReplayGuard {
    async fn check_and_insert(&self, nonce: u64, seen_at: i64) -> Result<bool> {
        let mut seen = self.seen();
        if seen.contains_key(&nonce) {
            return Ok(false);
        }
        seen.insert(nonce, seen_at);
        Ok(true)
    }

    async fn contains(&self, nonce: u64) -> Result<bool> {
        Ok(self.seen().contains_key(&nonce))
    }

    async fn evict_older_than(&self, cutoff: i64) -> Result<u64> {
        let mut seen = self.seen();
        let before = seen.len();
        seen.retain(|_, first_seen| *first_seen >= cutoff);
        Ok((before - seen.len()) as u64)
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.seen().len() as u64)
    }
}
