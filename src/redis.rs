use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tokio_util::sync::CancellationToken;

use crate::cache::{ensure_active, IdempotencyCache};
use crate::{CacheItem, IdempotencyError, IdempotencyKey};

/// Redis を使った冪等キャッシュ実装。
///
/// `SET NX PX` でプロセスをまたいでも原子的に挿入し、失効は Redis の TTL に任せる。
/// そのため `clear` に相当する操作は持たない。TTL は `created_at` からの残り時間で、
/// 既に保持期間を過ぎたレコードも最小 1ms は残る。
#[derive(Clone)]
pub struct RedisIdempotencyCache {
    pool: Pool,
    key_prefix: String,
    retention: Duration,
}

impl RedisIdempotencyCache {
    pub fn new(pool: Pool, retention: Duration) -> Self {
        Self {
            pool,
            key_prefix: "idempotency".to_string(),
            retention,
        }
    }

    /// カスタムキープレフィックスを設定する。
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn full_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// 保持期間の残り（ミリ秒）。PX 0 は Redis がエラーにするため最小 1ms
    fn ttl_millis(&self, item: &CacheItem, now: DateTime<Utc>) -> u64 {
        let remaining = self.retention.saturating_sub(item.age(now));
        (remaining.as_millis() as u64).max(1)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, IdempotencyError> {
        self.pool
            .get()
            .await
            .map_err(|e| IdempotencyError::StorageError(format!("Redis pool error: {}", e)))
    }
}

#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    async fn add(&self, ctx: &CancellationToken, item: CacheItem) -> Result<(), IdempotencyError> {
        ensure_active(ctx)?;
        let value = serde_json::to_string(&item)?;
        let full_key = self.full_key(&item.key);
        let millis = self.ttl_millis(&item, Utc::now());

        let mut conn = self.connection().await?;
        let reply: Option<String> = cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::StorageError(e.to_string()))?;

        match reply {
            Some(_) => Ok(()),
            None => Err(IdempotencyError::KeyConflict {
                key: item.key.into_inner(),
            }),
        }
    }

    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &IdempotencyKey,
    ) -> Result<CacheItem, IdempotencyError> {
        ensure_active(ctx)?;
        let mut conn = self.connection().await?;
        let value: Option<String> = cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::StorageError(e.to_string()))?;

        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(IdempotencyError::CacheKeyNotFound {
                key: key.to_string(),
            }),
        }
    }
}
