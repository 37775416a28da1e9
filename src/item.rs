use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::IdempotencyKey;

/// 冪等キー1件分の保存レコード。作成後は変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    /// 作成順にソート可能な ID（UUID v7）
    pub id: Uuid,
    pub key: IdempotencyKey,
    /// 元リクエストの内容を表す不透明な値
    pub fingerprint: String,
    pub request_body: String,
    pub response_body: String,
    pub created_at: DateTime<Utc>,
}

impl CacheItem {
    pub fn new(
        key: impl Into<IdempotencyKey>,
        fingerprint: impl Into<String>,
        request_body: impl Into<String>,
        response_body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            key: key.into(),
            fingerprint: fingerprint.into(),
            request_body: request_body.into(),
            response_body: response_body.into(),
            created_at: Utc::now(),
        }
    }

    /// `now` 時点での経過時間。`created_at` が未来の場合はゼロ。
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// 経過時間が保持期間を超えていれば true
    pub fn is_expired_at(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > retention
    }

    pub fn is_expired(&self, retention: Duration) -> bool {
        self.is_expired_at(retention, Utc::now())
    }

    pub fn fingerprint_matches(&self, fingerprint: &str) -> bool {
        self.fingerprint == fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_fields() {
        let item = CacheItem::new("k1", "fp1", "req", "resp");
        assert_eq!(item.key.as_str(), "k1");
        assert_eq!(item.fingerprint, "fp1");
        assert_eq!(item.request_body, "req");
        assert_eq!(item.response_body, "resp");
        assert_eq!(item.id.get_version_num(), 7);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = CacheItem::new("a", "fp", "", "");
        std::thread::sleep(Duration::from_millis(2));
        let second = CacheItem::new("b", "fp", "", "");
        assert!(first.id < second.id);
    }

    #[test]
    fn test_is_expired_at_boundary() {
        let mut item = CacheItem::new("k", "fp", "", "");
        let now = Utc::now();
        item.created_at = now - chrono::Duration::seconds(60);
        assert!(!item.is_expired_at(Duration::from_secs(60), now));
        assert!(item.is_expired_at(Duration::from_secs(59), now));
    }

    #[test]
    fn test_future_created_at_is_not_expired() {
        let mut item = CacheItem::new("k", "fp", "", "");
        item.created_at = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(item.age(Utc::now()), Duration::ZERO);
        assert!(!item.is_expired(Duration::from_millis(1)));
    }

    #[test]
    fn test_fingerprint_matches() {
        let item = CacheItem::new("k", "fp1", "", "");
        assert!(item.fingerprint_matches("fp1"));
        assert!(!item.fingerprint_matches("fp2"));
    }

    #[test]
    fn test_serde_preserves_record() {
        let item = CacheItem::new("k", "fp", r#"{"a":1}"#, r#"{"ok":true}"#);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""key":"k""#));
        let back: CacheItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }
}
