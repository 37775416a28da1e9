use std::fmt;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::IdempotencyError;

/// Idempotency-Key ヘッダー名
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// クライアントが生成する冪等キー
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdempotencyKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// リクエストヘッダーから冪等キーを取り出す。
///
/// ヘッダーが無い、文字列として読めない、または空白のみの場合は
/// `KeyNotFoundInRequest` を返す。
pub fn key_from_headers(
    headers: &HeaderMap,
    header_name: &str,
) -> Result<IdempotencyKey, IdempotencyError> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(IdempotencyKey::from)
        .ok_or(IdempotencyError::KeyNotFoundInRequest)
}
