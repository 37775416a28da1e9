use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::cache::IdempotencyCache;
use crate::key::{key_from_headers, IDEMPOTENCY_KEY_HEADER};
use crate::{CacheItem, IdempotencyError, IdempotencyKey};

/// 再送時のレスポンスに付与するヘッダー
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// バッファするリクエストボディの既定上限（axum の DefaultBodyLimit と同じ 2MB）
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// true を返したリクエストは冪等チェックを行わない
pub type SkipFn = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// リクエスト内容からフィンガープリントを計算する
pub type FingerprintFn = Arc<dyn Fn(&Method, &Uri, &[u8]) -> String + Send + Sync>;

/// `CacheItem::response_body` に保存するレスポンスのスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

/// メソッド、パス+クエリ、ボディの SHA-256（hex）
pub fn default_fingerprint(method: &Method, uri: &Uri, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    let path = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// idempotency_middleware の設定
#[derive(Clone)]
pub struct IdempotencyConfig {
    /// ヘッダー名（デフォルト: "idempotency-key"）
    pub header_name: String,
    /// true の場合、キーの無いリクエストは 400 を返す
    pub require_key: bool,
    /// 超えた場合は 413 を返す
    pub max_body_bytes: usize,
    pub skip: SkipFn,
    pub fingerprint: FingerprintFn,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            require_key: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            skip: Arc::new(|_| false),
            fingerprint: Arc::new(default_fingerprint),
        }
    }
}

impl IdempotencyConfig {
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn require_key(mut self, require: bool) -> Self {
        self.require_key = require;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_skip_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.skip = Arc::new(f);
        self
    }

    pub fn with_fingerprint_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Method, &Uri, &[u8]) -> String + Send + Sync + 'static,
    {
        self.fingerprint = Arc::new(f);
        self
    }
}

/// ハンドラー実行中のキー集合。キャッシュは挿入のみのため、
/// 処理中の予約はミドルウェア側で持つ。
#[derive(Clone, Default)]
struct InFlight {
    keys: Arc<Mutex<HashSet<IdempotencyKey>>>,
}

impl InFlight {
    /// 予約できなければ None（同じキーが処理中）
    fn reserve(&self, key: &IdempotencyKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key: key.clone(),
        })
    }
}

/// drop で予約を解放する
struct InFlightGuard {
    keys: Arc<Mutex<HashSet<IdempotencyKey>>>,
    key: IdempotencyKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}

/// ミドルウェアに渡すキャッシュ、設定、処理中キー。
/// 同じキャッシュを共有するルーター間では同じ State をクローンして使うこと。
#[derive(Clone)]
pub struct IdempotencyState {
    pub cache: Arc<dyn IdempotencyCache>,
    pub config: IdempotencyConfig,
    in_flight: InFlight,
}

impl IdempotencyState {
    pub fn new(cache: Arc<dyn IdempotencyCache>) -> Self {
        Self::with_config(cache, IdempotencyConfig::default())
    }

    pub fn with_config(cache: Arc<dyn IdempotencyCache>, config: IdempotencyConfig) -> Self {
        Self {
            cache,
            config,
            in_flight: InFlight::default(),
        }
    }
}

/// 冪等キー付きリクエストを 1 度だけ実行し、再送には保存済みレスポンスを返す。
///
/// 同じキーのリクエストが処理中なら 409、別内容での再利用は 422。
///
/// ```ignore
/// use axum::{Router, middleware};
/// use k1s0_idempotency_cache::{idempotency_middleware, IdempotencyState, InMemoryIdempotencyCache};
///
/// let cache = InMemoryIdempotencyCache::new(Duration::from_secs(3600));
/// let shutdown = CancellationToken::new();
/// let sweeper = cache.spawn_sweeper(Duration::from_secs(60), shutdown.clone());
///
/// let state = IdempotencyState::new(Arc::new(cache));
/// let app = Router::new()
///     .route("/payments", post(create_payment))
///     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if (state.config.skip)(&req) {
        return next.run(req).await;
    }

    let key = match key_from_headers(req.headers(), &state.config.header_name) {
        Ok(k) => k,
        Err(e) if state.config.require_key => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        Err(_) => return next.run(req).await,
    };

    let (parts, body) = req.into_parts();
    let request_bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.into_inner().is::<LengthLimitError>() {
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
            return (StatusCode::BAD_REQUEST, "リクエストボディを読み取れません").into_response();
        }
    };
    let fingerprint = (state.config.fingerprint)(&parts.method, &parts.uri, &request_bytes);

    // 保存が終わるまで同じキーの後続リクエストを通さない
    let _guard = match state.in_flight.reserve(&key) {
        Some(guard) => guard,
        None => {
            return (StatusCode::CONFLICT, "リクエストは現在処理中です").into_response();
        }
    };

    // リクエスト単位のキャンセルはフューチャーの破棄で表現されるため、ここでは発火しない
    let ctx = CancellationToken::new();

    // 既存レコードを確認
    match state.cache.get(&ctx, &key).await {
        Ok(item) if item.fingerprint_matches(&fingerprint) => {
            return replay(&item);
        }
        Ok(_) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                "同じ冪等キーが異なるリクエストに使用されています",
            )
                .into_response();
        }
        Err(IdempotencyError::CacheKeyNotFound { .. }) => {}
        Err(e) => {
            tracing::warn!("idempotency cache get error: {}", e);
        }
    }

    let request_body = String::from_utf8_lossy(&request_bytes).to_string();
    let req = Request::from_parts(parts, Body::from(request_bytes));

    // ハンドラー実行
    let response = next.run(req).await;

    let (parts, body) = response.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    if parts.status.is_success() {
        let stored = StoredResponse {
            status: parts.status.as_u16(),
            body: String::from_utf8_lossy(&body_bytes).to_string(),
        };
        match serde_json::to_string(&stored) {
            Ok(response_body) => {
                let item = CacheItem::new(key, fingerprint, request_body, response_body);
                match state.cache.add(&ctx, item).await {
                    Ok(()) => {}
                    // 別プロセスが先に保存した
                    Err(IdempotencyError::KeyConflict { key }) => {
                        tracing::debug!(key = %key, "idempotency record already stored");
                    }
                    Err(e) => {
                        tracing::warn!("idempotency cache add error: {}", e);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("idempotency response serialization error: {}", e);
            }
        }
    }

    Response::from_parts(parts, Body::from(body_bytes))
}

fn replay(item: &CacheItem) -> Response {
    let stored: StoredResponse = match serde_json::from_str(&item.response_body) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(key = %item.key, "stored idempotency response is corrupt: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    tracing::debug!(key = %item.key, "replaying idempotent response");
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    (status, [(IDEMPOTENT_REPLAYED_HEADER, "true")], stored.body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fingerprint_is_stable() {
        let uri: Uri = "/orders?x=1".parse().unwrap();
        let a = default_fingerprint(&Method::POST, &uri, b"{}");
        let b = default_fingerprint(&Method::POST, &uri, b"{}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_default_fingerprint_differs_by_content() {
        let uri: Uri = "/orders".parse().unwrap();
        let base = default_fingerprint(&Method::POST, &uri, b"{\"n\":1}");
        assert_ne!(base, default_fingerprint(&Method::POST, &uri, b"{\"n\":2}"));
        assert_ne!(base, default_fingerprint(&Method::PUT, &uri, b"{\"n\":1}"));
        let other: Uri = "/orders?dry=1".parse().unwrap();
        assert_ne!(base, default_fingerprint(&Method::POST, &other, b"{\"n\":1}"));
    }

    #[test]
    fn test_replay_corrupt_record_is_server_error() {
        let item = CacheItem::new("k", "fp", "", "not json");
        let response = replay(&item);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_in_flight_reserve_is_exclusive_until_drop() {
        let in_flight = InFlight::default();
        let key = IdempotencyKey::from("pay-1");

        let guard = in_flight.reserve(&key).unwrap();
        assert!(in_flight.reserve(&key).is_none());
        assert!(in_flight.reserve(&IdempotencyKey::from("pay-2")).is_some());

        drop(guard);
        assert!(in_flight.reserve(&key).is_some());
    }

    #[test]
    fn test_state_clones_share_in_flight_keys() {
        let state = IdempotencyState::new(Arc::new(crate::InMemoryIdempotencyCache::new(
            std::time::Duration::from_secs(60),
        )));
        let other = state.clone();
        let key = IdempotencyKey::from("shared");
        let _guard = state.in_flight.reserve(&key).unwrap();
        assert!(other.in_flight.reserve(&key).is_none());
    }
}
