use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A server-issued CSRF token with its absolute expiry.
///
/// Value and expiry always travel together: they are persisted as one record
/// and cleared as one record, never independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// A token is usable iff `now < expires_at`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Abstraction over durable token storage backends.
/// Implementations: FileStore (JSON on disk), MemoryStore (tests and
/// placeholder-token sessions).
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the persisted token, if any. Expired tokens are discarded here
    /// rather than handed back to the caller.
    async fn load(&self) -> Option<StoredToken>;

    /// Persist a token, replacing any previous record.
    async fn save(&self, token: &StoredToken);

    /// Drop the persisted token.
    async fn clear(&self);
}

/// JSON-file-backed store — the durable client-side storage for the token.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for FileStore {
    async fn load(&self) -> Option<StoredToken> {
        let raw = tokio::fs::read_to_string(&self.path).await.ok()?;
        let token: StoredToken = match serde_json::from_str(&raw) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "discarding unreadable token record");
                self.clear().await;
                return None;
            }
        };

        if token.is_fresh(Utc::now()) {
            Some(token)
        } else {
            self.clear().await;
            None
        }
    }

    async fn save(&self, token: &StoredToken) {
        let json = match serde_json::to_string(token) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize token record");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist token record");
        }
    }

    async fn clear(&self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

/// In-memory store. Used by tests, and as the backing store when no durable
/// path is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<Option<StoredToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn load(&self) -> Option<StoredToken> {
        let mut guard = self.inner.lock().await;
        match guard.as_ref() {
            Some(t) if t.is_fresh(Utc::now()) => Some(t.clone()),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    async fn save(&self, token: &StoredToken) {
        *self.inner.lock().await = Some(token.clone());
    }

    async fn clear(&self) {
        *self.inner.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_freshness_boundary() {
        let now = Utc::now();
        let token = StoredToken::new("abc", now + Duration::seconds(1));
        assert!(token.is_fresh(now));
        assert!(!token.is_fresh(now + Duration::seconds(1)));
        assert!(!token.is_fresh(now + Duration::seconds(2)));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_clear() {
        let store = MemoryStore::new();
        assert!(store.load().await.is_none());

        let token = StoredToken::new("abc123", Utc::now() + Duration::hours(1));
        store.save(&token).await;
        assert_eq!(store.load().await, Some(token));

        store.clear().await;
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_discards_expired_on_load() {
        let store = MemoryStore::new();
        let token = StoredToken::new("stale", Utc::now() - Duration::seconds(5));
        store.save(&token).await;
        assert!(store.load().await.is_none());
        // discarded, not just hidden
        assert!(store.inner.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("csrf_token.json"));

        let token = StoredToken::new("abc123", Utc::now() + Duration::hours(1));
        store.save(&token).await;
        assert_eq!(store.load().await, Some(token));

        store.clear().await;
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_file_store_discards_expired_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csrf_token.json");
        let store = FileStore::new(&path);

        let token = StoredToken::new("stale", Utc::now() - Duration::hours(1));
        store.save(&token).await;
        assert!(store.load().await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_store_tolerates_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csrf_token.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let store = FileStore::new(&path);
        assert!(store.load().await.is_none());
    }
}
