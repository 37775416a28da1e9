use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{CacheProvider, InMemoryIdempotencyCache};

/// 既定の保持期間（24時間）
pub const DEFAULT_RETENTION_SECS: u64 = 86400;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// 冪等キャッシュのバックエンド設定
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IdempotencyCacheConfig {
    pub provider: CacheProvider,
    /// レコードの保持期間（秒）
    pub retention_secs: u64,
    /// インメモリ実装の掃除間隔（秒）
    pub sweep_interval_secs: u64,
    pub key_prefix: Option<String>,
}

impl Default for IdempotencyCacheConfig {
    fn default() -> Self {
        Self {
            provider: CacheProvider::Memory,
            retention_secs: DEFAULT_RETENTION_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            key_prefix: None,
        }
    }
}

impl IdempotencyCacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_secs == 0 {
            return Err(ConfigError::Validation(
                "retention_secs must be > 0".into(),
            ));
        }
        if self.provider == CacheProvider::Memory && self.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweep_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// インメモリ実装を構築し、`sweep_interval` ごとの掃除タスクを起動する。
    /// 掃除タスクは `ctx` のキャンセルで停止する。Database は接続プールが必要なため呼び出し側で構築する。
    pub fn build_memory_cache(
        &self,
        ctx: CancellationToken,
    ) -> Result<(InMemoryIdempotencyCache, JoinHandle<()>), ConfigError> {
        self.validate()?;
        self.expect_provider(CacheProvider::Memory)?;
        let cache = InMemoryIdempotencyCache::new(self.retention());
        let sweeper = cache.spawn_sweeper(self.sweep_interval(), ctx);
        Ok((cache, sweeper))
    }

    /// Redis 実装を構築する。`key_prefix` があればキーに付与する。
    #[cfg(feature = "redis")]
    pub fn build_redis_cache(
        &self,
        pool: deadpool_redis::Pool,
    ) -> Result<crate::RedisIdempotencyCache, ConfigError> {
        self.validate()?;
        self.expect_provider(CacheProvider::Redis)?;
        let cache = crate::RedisIdempotencyCache::new(pool, self.retention());
        Ok(match &self.key_prefix {
            Some(prefix) => cache.with_prefix(prefix.clone()),
            None => cache,
        })
    }

    fn expect_provider(&self, expected: CacheProvider) -> Result<(), ConfigError> {
        if self.provider != expected {
            return Err(ConfigError::Validation(format!(
                "provider {} cannot be built as {}",
                self.provider, expected
            )));
        }
        Ok(())
    }
}
