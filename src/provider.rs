use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// キャッシュのバックエンド種別
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheProvider {
    Database,
    Redis,
    #[default]
    Memory,
}

impl CacheProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheProvider::Database => "database",
            CacheProvider::Redis => "redis",
            CacheProvider::Memory => "memory",
        }
    }
}

impl fmt::Display for CacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "database" => Ok(CacheProvider::Database),
            "redis" => Ok(CacheProvider::Redis),
            "memory" => Ok(CacheProvider::Memory),
            other => Err(format!("不明なキャッシュプロバイダです: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_is_case_insensitive() {
        assert_eq!("Redis".parse::<CacheProvider>(), Ok(CacheProvider::Redis));
        assert_eq!("MEMORY".parse::<CacheProvider>(), Ok(CacheProvider::Memory));
        assert_eq!(
            "database".parse::<CacheProvider>(),
            Ok(CacheProvider::Database)
        );
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        let err = "memcached".parse::<CacheProvider>().unwrap_err();
        assert!(err.contains("memcached"));
    }

    #[test]
    fn test_display_matches_serde() {
        for provider in [
            CacheProvider::Database,
            CacheProvider::Redis,
            CacheProvider::Memory,
        ] {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider));
        }
    }

    #[test]
    fn test_default_is_memory() {
        assert_eq!(CacheProvider::default(), CacheProvider::Memory);
    }
}
