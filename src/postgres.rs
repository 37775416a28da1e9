use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{ensure_active, IdempotencyCache};
use crate::{CacheItem, IdempotencyError, IdempotencyKey};

/// PostgreSQL を使った冪等キャッシュ実装。
///
/// `key` の主キー制約と `ON CONFLICT DO NOTHING` により、複数プロセスからの
/// 同時 `add` でも成功するのは 1 件のみ。
#[derive(Clone)]
pub struct PostgresIdempotencyCache {
    pool: PgPool,
    table: String,
    retention: Duration,
}

type ItemRow = (Uuid, String, String, String, String, DateTime<Utc>);

impl PostgresIdempotencyCache {
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self {
            pool,
            table: "idempotency_cache".to_string(),
            retention,
        }
    }

    /// テーブル名を変更する。呼び出し側が信頼できる識別子を渡すこと。
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// テーブルが無ければ作成する。
    pub async fn migrate(&self) -> Result<(), IdempotencyError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                id UUID NOT NULL,
                fingerprint TEXT NOT NULL,
                request_body TEXT NOT NULL,
                response_body TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            table = self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// 保持期間を過ぎたレコードを削除し、削除件数を返す。
    pub async fn clear(&self, ctx: &CancellationToken) -> Result<usize, IdempotencyError> {
        ensure_active(ctx)?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| IdempotencyError::StorageError(e.to_string()))?;
        let sql = format!("DELETE FROM {} WHERE created_at < $1", self.table);
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl IdempotencyCache for PostgresIdempotencyCache {
    async fn add(&self, ctx: &CancellationToken, item: CacheItem) -> Result<(), IdempotencyError> {
        ensure_active(ctx)?;
        let sql = format!(
            "INSERT INTO {} (key, id, fingerprint, request_body, response_body, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (key) DO NOTHING",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(item.key.as_str())
            .bind(item.id)
            .bind(&item.fingerprint)
            .bind(&item.request_body)
            .bind(&item.response_body)
            .bind(item.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::KeyConflict {
                key: item.key.into_inner(),
            });
        }
        Ok(())
    }

    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &IdempotencyKey,
    ) -> Result<CacheItem, IdempotencyError> {
        ensure_active(ctx)?;
        let sql = format!(
            "SELECT id, key, fingerprint, request_body, response_body, created_at
             FROM {} WHERE key = $1",
            self.table
        );
        let row: Option<ItemRow> = sqlx::query_as(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some((id, key, fingerprint, request_body, response_body, created_at)) => {
                Ok(CacheItem {
                    id,
                    key: key.into(),
                    fingerprint,
                    request_body,
                    response_body,
                    created_at,
                })
            }
            None => Err(IdempotencyError::CacheKeyNotFound {
                key: key.to_string(),
            }),
        }
    }
}

fn map_sqlx_error(err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::StorageError(err.to_string())
}
