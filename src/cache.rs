use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{CacheItem, IdempotencyError, IdempotencyKey};

/// すべてのバックエンドが満たす冪等キャッシュの契約。
///
/// `ctx` が既にキャンセルされている場合、各操作は `Cancelled` を返す。
#[async_trait]
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait IdempotencyCache: Send + Sync {
    /// キーが未登録の場合のみ挿入する（既存キーは Err(KeyConflict)、既存レコードは変更しない）
    async fn add(&self, ctx: &CancellationToken, item: CacheItem) -> Result<(), IdempotencyError>;
    /// 有効なレコードを取得する（無ければ Err(CacheKeyNotFound)）
    async fn get(
        &self,
        ctx: &CancellationToken,
        key: &IdempotencyKey,
    ) -> Result<CacheItem, IdempotencyError>;
}

pub(crate) fn ensure_active(ctx: &CancellationToken) -> Result<(), IdempotencyError> {
    if ctx.is_cancelled() {
        return Err(IdempotencyError::Cancelled);
    }
    Ok(())
}
