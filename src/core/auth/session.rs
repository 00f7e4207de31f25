//! Session lifecycle
//!
//! [`SessionManager`] creates, resolves and revokes server-side sessions.
//! The primary store is authoritative; the secondary store caches sessions
//! under `session:{sha256(token)}` so the raw bearer token never becomes a
//! cache key. Stores without TTL support are not used as a session cache,
//! since nothing would evict an entry for a session revoked elsewhere.
//! Expired sessions are removed lazily when they are resolved.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::db::models::{Session, SessionMetadata};
use crate::core::db::store::{Deadline, PrimaryStore};
use crate::core::error::AuthError;
use crate::core::options::AuthOptions;
use crate::core::storage::{SecondaryStore, StorageError};

/// Random bytes per token (256 bits)
const TOKEN_BYTES: usize = 32;

/// Generate an unguessable hex token
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of a token, hex encoded
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn cache_key(token: &str) -> String {
    format!("session:{}", hash_token(token))
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

fn expiry(from: DateTime<Utc>, ttl: TimeDelta) -> Result<DateTime<Utc>, AuthError> {
    from.checked_add_signed(ttl)
        .ok_or_else(|| AuthError::Configuration("session lifetime overflows".to_string()))
}

/// Session manager with cache-aside lookups
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn PrimaryStore>,
    cache: Arc<dyn SecondaryStore>,
    deadline: Deadline,
    session_ttl: TimeDelta,
    short_session_ttl: TimeDelta,
    update_age: TimeDelta,
}

impl SessionManager {
    pub fn new(store: Arc<dyn PrimaryStore>, options: &AuthOptions) -> Self {
        Self {
            store,
            cache: options.secondary_store.clone(),
            deadline: Deadline::new(options.store_timeout),
            session_ttl: to_delta(options.session_ttl),
            short_session_ttl: to_delta(options.short_session_ttl),
            update_age: to_delta(options.session_update_age),
        }
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Create a session. `remember_me = false` uses the short lifetime.
    pub async fn create(
        &self,
        user_id: &str,
        metadata: SessionMetadata,
        remember_me: bool,
    ) -> Result<Session, AuthError> {
        self.create_at(user_id, metadata, remember_me, Utc::now())
            .await
    }

    pub(crate) async fn create_at(
        &self,
        user_id: &str,
        metadata: SessionMetadata,
        remember_me: bool,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let ttl = if remember_me {
            self.session_ttl
        } else {
            self.short_session_ttl
        };

        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token: generate_token(),
            created_at: now,
            expires_at: expiry(now, ttl)?,
            updated_at: now,
            ip_address: metadata.ip_address,
            user_agent: metadata.user_agent,
        };

        self.deadline
            .run(self.store.insert_session(&session))
            .await?;
        if let Err(e) = self.cache_put(&session, now).await {
            // A row whose cache entry may be stale must not outlive the error
            if let Err(cleanup) = self
                .deadline
                .run(self.store.delete_session(&session.id))
                .await
            {
                tracing::warn!("Failed to remove session {}: {}", session.id, cleanup);
            }
            return Err(e);
        }

        tracing::debug!("Session {} created for user {}", session.id, user_id);
        Ok(session)
    }

    // ========================================================================
    // Resolve
    // ========================================================================

    /// Resolve a bearer token to its live session
    pub async fn resolve(&self, token: &str) -> Result<Session, AuthError> {
        self.resolve_at(token, Utc::now()).await
    }

    pub(crate) async fn resolve_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        if token.is_empty() {
            return Err(AuthError::SessionNotFound);
        }

        let session = match self.cache_get(token).await {
            Some(session) => {
                tracing::debug!("Session cache hit");
                session
            }
            None => {
                tracing::debug!("Session cache miss");
                let session = self
                    .deadline
                    .run(self.store.find_session_by_token(token))
                    .await?
                    .ok_or(AuthError::SessionNotFound)?;
                if !session.is_expired_at(now) {
                    self.cache_put(&session, now).await?;
                }
                session
            }
        };

        if session.is_expired_at(now) {
            self.remove(&session).await?;
            return Err(AuthError::SessionExpired);
        }

        if now - session.updated_at >= self.update_age {
            return self.refresh(session, now).await;
        }

        Ok(session)
    }

    /// Slide the expiry window forward, keeping the session's lifetime
    async fn refresh(&self, session: Session, now: DateTime<Utc>) -> Result<Session, AuthError> {
        let lifetime = session.expires_at - session.created_at;
        let refreshed = self
            .deadline
            .run(
                self.store
                    .refresh_session(&session.id, now, expiry(now, lifetime)?),
            )
            .await?;

        match refreshed {
            Some(session) => {
                self.cache_put(&session, now).await?;
                tracing::debug!("Session {} refreshed", session.id);
                Ok(session)
            }
            None => {
                // Revoked concurrently
                self.cache_delete(&session.token).await?;
                Err(AuthError::SessionNotFound)
            }
        }
    }

    // ========================================================================
    // Revoke
    // ========================================================================

    /// Revoke a session by id; `false` if it did not exist
    pub async fn revoke(&self, session_id: &str) -> Result<bool, AuthError> {
        let Some(session) = self
            .deadline
            .run(self.store.find_session_by_id(session_id))
            .await?
        else {
            return Ok(false);
        };
        self.remove(&session).await
    }

    /// Revoke every session of `user_id` except `except`; returns the count
    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        except: Option<&str>,
    ) -> Result<usize, AuthError> {
        let sessions = self
            .deadline
            .run(self.store.find_sessions_by_user(user_id))
            .await?;

        let mut revoked = 0;
        for session in sessions.iter().filter(|s| Some(s.id.as_str()) != except) {
            if self.remove(session).await? {
                revoked += 1;
            }
        }

        tracing::info!("Revoked {} session(s) for user {}", revoked, user_id);
        Ok(revoked)
    }

    /// Invalidate the cache entry, delete the row, then invalidate again to
    /// drop a copy re-cached by a concurrent resolve. The row is kept when
    /// the cache cannot be cleared, so a failed revoke can be retried.
    async fn remove(&self, session: &Session) -> Result<bool, AuthError> {
        self.cache_delete(&session.token).await?;
        let deleted = self
            .deadline
            .run(self.store.delete_session(&session.id))
            .await?;
        self.cache_delete(&session.token).await?;
        Ok(deleted)
    }

    // ========================================================================
    // Cache helpers
    // ========================================================================

    /// Cached session, or `None` on miss. Read failures fall back to the
    /// primary store.
    async fn cache_get(&self, token: &str) -> Option<Session> {
        let key = cache_key(token);
        match self.cache.get(&key).await {
            Ok(value) => match serde_json::from_str::<Session>(&value) {
                Ok(session) if session.token == token => Some(session),
                _ => {
                    tracing::warn!("Discarding unreadable cached session");
                    let _ = self.cache.delete(&key).await;
                    None
                }
            },
            Err(StorageError::NotFound) => None,
            Err(e) => {
                tracing::warn!("Session cache read failed, using primary store: {}", e);
                None
            }
        }
    }

    /// Write through with the session's remaining lifetime. If the write
    /// fails the entry is invalidated so no stale copy survives; only a
    /// failed invalidation is an error.
    async fn cache_put(&self, session: &Session, now: DateTime<Utc>) -> Result<(), AuthError> {
        let key = cache_key(&session.token);
        let ttl = (session.expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));

        let written = match serde_json::to_string(session) {
            Ok(value) => self.cache.set_with_ttl(&key, value, ttl).await,
            Err(e) => Err(StorageError::Backend(e.to_string())),
        };

        match written {
            Ok(()) => Ok(()),
            Err(StorageError::TtlUnsupported) => {
                tracing::debug!("Secondary store has no TTL, session not cached");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Session cache write failed: {}", e);
                self.cache.delete(&key).await?;
                Ok(())
            }
        }
    }

    async fn cache_delete(&self, token: &str) -> Result<(), AuthError> {
        self.cache.delete(&cache_key(token)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::MemoryStore;
    use crate::core::db::migration::MigrationRunner;
    use crate::core::db::models::NewUser;
    use crate::core::schema::{TableNames, auth_schema};
    use crate::core::storage::{Counter, MemoryStorage, TtlMemoryStorage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<dyn SecondaryStore>,
        manager: SessionManager,
    }

    async fn fixture_with(cache: Arc<dyn SecondaryStore>, options: AuthOptions) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = auth_schema(&TableNames::default(), false).unwrap();
        MigrationRunner::new(&registry)
            .run(store.as_ref())
            .await
            .unwrap();
        store
            .insert_user(
                "u1",
                &NewUser {
                    name: "A".to_string(),
                    email: "a@x.com".to_string(),
                    image: None,
                    username: None,
                    password_hash: "s:k".to_string(),
                },
            )
            .await
            .unwrap();

        let options = options.secondary_store(cache.clone());
        let manager = SessionManager::new(store.clone(), &options);
        Fixture {
            store,
            cache,
            manager,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(TtlMemoryStorage::new()), AuthOptions::default()).await
    }

    /// Secondary store whose every call fails
    struct BrokenStorage;

    #[async_trait]
    impl SecondaryStore for BrokenStorage {
        async fn get(&self, _key: &str) -> Result<String, StorageError> {
            Err(StorageError::Backend("down".to_string()))
        }
        async fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".to_string()))
        }
        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: String,
            _ttl: Duration,
        ) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".to_string()))
        }
        async fn increment(&self, _key: &str, _window: Duration) -> Result<Counter, StorageError> {
            Err(StorageError::Backend("down".to_string()))
        }
    }

    /// TTL-capable store whose deletes can be switched to fail
    #[derive(Default)]
    struct FlakyDeletes {
        inner: TtlMemoryStorage,
        fail_deletes: AtomicBool,
    }

    #[async_trait]
    impl SecondaryStore for FlakyDeletes {
        async fn get(&self, key: &str) -> Result<String, StorageError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
            self.inner.set(key, value).await
        }
        async fn set_with_ttl(
            &self,
            key: &str,
            value: String,
            ttl: Duration,
        ) -> Result<(), StorageError> {
            self.inner.set_with_ttl(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("delete refused".to_string()));
            }
            self.inner.delete(key).await
        }
        async fn increment(&self, key: &str, window: Duration) -> Result<Counter, StorageError> {
            self.inner.increment(key, window).await
        }
    }

    // ========================================================================
    // Token Tests
    // ========================================================================

    #[test]
    fn test_generate_token() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_hides_token() {
        let key = cache_key("secret-token");
        assert!(key.starts_with("session:"));
        assert!(!key.contains("secret-token"));
        assert_eq!(key, cache_key("secret-token"));
    }

    // ========================================================================
    // Create / Resolve Tests
    // ========================================================================

    #[tokio::test]
    async fn test_create_then_resolve() {
        let f = fixture().await;
        let metadata = SessionMetadata {
            ip_address: Some("127.0.0.1".to_string()),
            user_agent: Some("test".to_string()),
        };
        let session = f.manager.create("u1", metadata, true).await.unwrap();

        assert_eq!(session.user_id, "u1");
        assert!(session.expires_at > session.created_at);
        assert_eq!(session.expires_at - session.created_at, TimeDelta::days(7));
        assert!(f.cache.get(&cache_key(&session.token)).await.is_ok());

        let resolved = f.manager.resolve(&session.token).await.unwrap();
        assert_eq!(resolved, session);
    }

    #[tokio::test]
    async fn test_short_session_without_remember_me() {
        let f = fixture().await;
        let session = f
            .manager
            .create("u1", SessionMetadata::default(), false)
            .await
            .unwrap();
        assert_eq!(session.expires_at - session.created_at, TimeDelta::days(1));
    }

    #[tokio::test]
    async fn test_resolve_unknown_token() {
        let f = fixture().await;
        assert_eq!(
            f.manager.resolve("nope").await.unwrap_err(),
            AuthError::SessionNotFound
        );
        assert_eq!(
            f.manager.resolve("").await.unwrap_err(),
            AuthError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn test_cache_miss_repopulates() {
        let f = fixture().await;
        let session = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();
        let key = cache_key(&session.token);
        f.cache.delete(&key).await.unwrap();

        let resolved = f.manager.resolve(&session.token).await.unwrap();
        assert_eq!(resolved, session);
        assert!(f.cache.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_session_is_deleted_lazily() {
        let f = fixture().await;
        let now = Utc::now();
        let session = f
            .manager
            .create_at("u1", SessionMetadata::default(), true, now)
            .await
            .unwrap();

        let before = session.expires_at - TimeDelta::seconds(1);
        assert!(f.manager.resolve_at(&session.token, before).await.is_ok());

        let after = session.expires_at;
        assert_eq!(
            f.manager.resolve_at(&session.token, after).await.unwrap_err(),
            AuthError::SessionExpired
        );
        assert_eq!(f.store.session_count().await, 0);
        assert!(f.cache.get(&cache_key(&session.token)).await.is_err());
        assert_eq!(
            f.manager.resolve_at(&session.token, after).await.unwrap_err(),
            AuthError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn test_stale_session_is_refreshed() {
        let f = fixture().await;
        let now = Utc::now();
        let session = f
            .manager
            .create_at("u1", SessionMetadata::default(), true, now)
            .await
            .unwrap();

        let later = now + TimeDelta::days(2);
        let refreshed = f.manager.resolve_at(&session.token, later).await.unwrap();
        assert_eq!(refreshed.updated_at, later);
        assert_eq!(refreshed.expires_at, later + TimeDelta::days(7));

        let stored = f
            .store
            .find_session_by_id(&session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.expires_at, refreshed.expires_at);

        let cached: Session =
            serde_json::from_str(&f.cache.get(&cache_key(&session.token)).await.unwrap())
                .unwrap();
        assert_eq!(cached.expires_at, refreshed.expires_at);
    }

    #[tokio::test]
    async fn test_ttl_less_cache_is_skipped() {
        let cache = Arc::new(MemoryStorage::new());
        let f = fixture_with(cache.clone(), AuthOptions::default()).await;
        let session = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();
        assert!(cache.is_empty());

        assert_eq!(f.manager.resolve(&session.token).await.unwrap(), session);
        assert!(f.manager.revoke(&session.id).await.unwrap());
        assert_eq!(
            f.manager.resolve(&session.token).await.unwrap_err(),
            AuthError::SessionNotFound
        );
        assert!(cache.is_empty());
    }

    // ========================================================================
    // Revoke Tests
    // ========================================================================

    #[tokio::test]
    async fn test_revoke_clears_both_stores() {
        let f = fixture().await;
        let session = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();

        assert!(f.manager.revoke(&session.id).await.unwrap());
        assert!(!f.manager.revoke(&session.id).await.unwrap());
        assert!(f.cache.get(&cache_key(&session.token)).await.is_err());
        assert_eq!(
            f.manager.resolve(&session.token).await.unwrap_err(),
            AuthError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn test_revoke_all_except_current() {
        let f = fixture().await;
        let keep = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();
        let other_a = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();
        let other_b = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();

        let revoked = f
            .manager
            .revoke_all_for_user("u1", Some(&keep.id))
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert!(f.manager.resolve(&keep.token).await.is_ok());
        assert!(f.manager.resolve(&other_a.token).await.is_err());
        assert!(f.manager.resolve(&other_b.token).await.is_err());
    }

    // ========================================================================
    // Failure Tests
    // ========================================================================

    #[tokio::test]
    async fn test_cache_write_failure_without_invalidation_surfaces() {
        let f = fixture_with(Arc::new(BrokenStorage), AuthOptions::default()).await;
        let result = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await;
        assert!(matches!(result, Err(AuthError::Persistence(_))));
        assert_eq!(f.store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_cache_delete_keeps_session() {
        let cache = Arc::new(FlakyDeletes::default());
        let f = fixture_with(cache.clone(), AuthOptions::default()).await;
        let session = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await
            .unwrap();

        cache.fail_deletes.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.manager.revoke(&session.id).await,
            Err(AuthError::Persistence(_))
        ));
        assert_eq!(f.store.session_count().await, 1);
        assert_eq!(f.manager.resolve(&session.token).await.unwrap(), session);

        cache.fail_deletes.store(false, Ordering::SeqCst);
        assert!(f.manager.revoke(&session.id).await.unwrap());
        assert_eq!(f.store.session_count().await, 0);
        assert_eq!(
            f.manager.resolve(&session.token).await.unwrap_err(),
            AuthError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn test_unbounded_lifetime_is_rejected() {
        let options = AuthOptions::default().session_ttl(Duration::MAX);
        let f = fixture_with(Arc::new(TtlMemoryStorage::new()), options).await;
        let result = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await;
        assert!(matches!(result, Err(AuthError::Configuration(_))));
        assert_eq!(f.store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_primary_timeout() {
        let options = AuthOptions::default().store_timeout(Some(Duration::from_millis(20)));
        let f = fixture_with(Arc::new(MemoryStorage::new()), options).await;
        f.store.set_latency(Duration::from_millis(200));

        let result = f
            .manager
            .create("u1", SessionMetadata::default(), true)
            .await;
        assert_eq!(result.unwrap_err(), AuthError::StorageTimeout);
    }
}
