pub mod cache;
pub mod config;
pub mod error;
pub mod item;
pub mod key;
pub mod layer;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod provider;
#[cfg(feature = "redis")]
pub mod redis;

pub use cache::IdempotencyCache;
pub use config::{ConfigError, IdempotencyCacheConfig};
pub use error::IdempotencyError;
pub use item::CacheItem;
pub use key::{key_from_headers, IdempotencyKey, IDEMPOTENCY_KEY_HEADER};
pub use layer::{
    default_fingerprint, idempotency_middleware, FingerprintFn, IdempotencyConfig,
    IdempotencyState, SkipFn, StoredResponse, DEFAULT_MAX_BODY_BYTES, IDEMPOTENT_REPLAYED_HEADER,
};
pub use memory::InMemoryIdempotencyCache;
#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyCache;
pub use provider::CacheProvider;
#[cfg(feature = "redis")]
pub use self::redis::RedisIdempotencyCache;

#[cfg(feature = "mock")]
pub use cache::MockIdempotencyCache;
