use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{ensure_active, IdempotencyCache};
use crate::{CacheItem, IdempotencyError, IdempotencyKey};

/// プロセス内の冪等キャッシュ。
///
/// クローンしたハンドルは同じテーブルを共有する。期限切れレコードは
/// `clear` が呼ばれるまで残り、`get` からも見える。
#[derive(Debug, Clone)]
pub struct InMemoryIdempotencyCache {
    items: Arc<RwLock<HashMap<IdempotencyKey, CacheItem>>>,
    retention: Duration,
}

impl InMemoryIdempotencyCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// 保持期間を過ぎたレコードを削除し、削除件数を返す。
    ///
    /// 読み取りロック中に削除対象を集め、書き込みロックは削除の間だけ保持する。
    /// 走査中にキャンセルされた場合は何も削除せずに `Cancelled` を返す。
    pub async fn clear(&self, ctx: &CancellationToken) -> Result<usize, IdempotencyError> {
        let now = Utc::now();
        let expired: Vec<IdempotencyKey> = {
            let items = self.items.read().await;
            let mut expired = Vec::new();
            for (key, item) in items.iter() {
                ensure_active(ctx)?;
                if item.is_expired_at(self.retention, now) {
                    expired.push(key.clone());
                }
            }
            expired
        };

        if expired.is_empty() {
            return Ok(0);
        }

        let mut items = self.items.write().await;
        let mut evicted = 0;
        for key in expired {
            // 2 つのフェーズの間に同じキーで再登録されたレコードは残す
            if items
                .get(&key)
                .is_some_and(|item| item.is_expired_at(self.retention, now))
            {
                items.remove(&key);
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// `interval` ごとに `clear` を実行するバックグラウンドタスクを起動する。
    /// `ctx` がキャンセルされると停止する。
    pub fn spawn_sweeper(&self, interval: Duration, ctx: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match cache.clear(&ctx).await {
                            Ok(0) => {}
                            Ok(evicted) => {
                                tracing::debug!(evicted, "expired idempotency records evicted");
                            }
                            Err(IdempotencyError::Cancelled) => break,
                            Err(e) => tracing::warn!("idempotency sweep error: {}", e),
                        }
                    }
                }
            }
            tracing::debug!("idempotency sweeper stopped");
        })
    }
}

#[async_trait]
impl IdempotencyCache for InMemoryIdempotencyCache {
    async fn add(&self, ctx: &CancellationToken, item: CacheItem) -> Result<(), IdempotencyError> {
        ensure_active(ctx)?;
        let mut items = self.items.write().await;
        if items.contains_key(&item.key) {
            return Err(IdempotencyError::KeyConflict {
                key: item.key.into_inner(),
            });
        }
        items.insert(item.key.clone(), item);
        Ok(())
    }

    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &IdempotencyKey,
    ) -> Result<CacheItem, IdempotencyError> {
        ensure_active(ctx)?;
        let items = self.items.read().await;
        items
            .get(key)
            .cloned()
            .ok_or_else(|| IdempotencyError::CacheKeyNotFound {
                key: key.to_string(),
            })
    }
}
