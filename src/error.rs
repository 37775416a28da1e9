use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("リクエストに Idempotency-Key がありません")]
    KeyNotFoundInRequest,
    #[error("冪等キーが保存されていません: {key}")]
    CacheKeyNotFound { key: String },
    #[error("冪等キーは既に存在します: key={key}")]
    KeyConflict { key: String },
    #[error("操作がキャンセルされました")]
    Cancelled,
    #[error("シリアライズエラー: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("ストレージエラー: {0}")]
    StorageError(String),
}

impl IdempotencyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CacheKeyNotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KeyConflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_contains_key() {
        let err = IdempotencyError::KeyConflict {
            key: "order-42".to_string(),
        };
        assert!(err.to_string().contains("order-42"));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_predicates_are_exclusive() {
        assert!(IdempotencyError::Cancelled.is_cancelled());
        assert!(!IdempotencyError::KeyNotFoundInRequest.is_cancelled());
        let miss = IdempotencyError::CacheKeyNotFound {
            key: "k".to_string(),
        };
        assert!(miss.is_not_found());
        assert!(!miss.is_conflict());
    }
}
