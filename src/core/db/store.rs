//! Primary store abstraction
//!
//! [`PrimaryStore`] is the authoritative home of users, sessions and
//! verification tokens. Unique constraints are enforced by the store itself;
//! any pre-check done by callers is best-effort only.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::db::migration::MigrationTarget;
use crate::core::db::models::{NewUser, Session, User, UserUpdate, Verification};

/// Primary store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unique constraint violated on '{column}'")]
    UniqueViolation { column: String },

    #[error("Record not found")]
    NotFound,

    #[error("Store operation timed out")]
    Timeout,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::UniqueViolation {
                    column: column_from_constraint(db.constraint().unwrap_or_default()),
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Unique columns of the auth tables
const UNIQUE_COLUMNS: [&str; 5] = ["username", "identifier", "email", "token", "id"];

/// PostgreSQL names implicit unique constraints `{table}_{column}_key`.
/// Table names are configurable, so the column is matched by suffix.
fn column_from_constraint(constraint: &str) -> String {
    let trimmed = constraint.strip_suffix("_key").unwrap_or(constraint);
    UNIQUE_COLUMNS
        .iter()
        .find(|column| {
            trimmed
                .strip_suffix(*column)
                .is_some_and(|table| table.ends_with('_'))
        })
        .map_or(trimmed, |column| column)
        .to_string()
}

/// Typed access to the auth tables
#[async_trait]
pub trait PrimaryStore: MigrationTarget {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    async fn insert_user(&self, id: &str, user: &NewUser) -> Result<User, StoreError>;

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Fails with [`StoreError::NotFound`] if the user does not exist
    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<User, StoreError>;

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_session_by_id(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn find_session_by_token(&self, token: &str) -> Result<Option<Session>, StoreError>;

    async fn find_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Update `updated_at` and `expires_at`; `None` if the session is gone
    async fn refresh_session(
        &self,
        id: &str,
        updated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;

    async fn delete_session(&self, id: &str) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Verification tokens
    // ------------------------------------------------------------------

    async fn insert_verification(&self, verification: &Verification) -> Result<(), StoreError>;

    async fn find_verification(&self, identifier: &str)
    -> Result<Option<Verification>, StoreError>;

    async fn delete_verification(&self, id: &str) -> Result<bool, StoreError>;
}

/// Optional upper bound applied to every primary store call
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Duration>);

impl Deadline {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self(timeout)
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub async fn run<T, F>(self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.0 {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::Timeout)?,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_from_constraint() {
        assert_eq!(column_from_constraint("user_email_key"), "email");
        assert_eq!(column_from_constraint("user_username_key"), "username");
        assert_eq!(column_from_constraint("session_token_key"), "token");
        assert_eq!(column_from_constraint("verification_identifier_key"), "identifier");
        assert_eq!(column_from_constraint("custom"), "custom");
    }

    #[test]
    fn test_column_from_renamed_table_constraint() {
        assert_eq!(column_from_constraint("accounts_email_key"), "email");
        assert_eq!(column_from_constraint("app_logins_token_key"), "token");
        assert_eq!(column_from_constraint("my_user_username_key"), "username");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::UniqueViolation {
            column: "email".to_string(),
        };
        assert_eq!(format!("{}", err), "Unique constraint violated on 'email'");
        assert_eq!(format!("{}", StoreError::Timeout), "Store operation timed out");
    }

    #[test]
    fn test_pool_timeout_maps_to_timeout() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StoreError::Timeout));
    }

    #[tokio::test]
    async fn test_deadline_passes_through() {
        let result = Deadline::new(Some(Duration::from_secs(1)))
            .run(async { Ok::<_, StoreError>(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_deadline_times_out() {
        let result = Deadline::new(Some(Duration::from_millis(10)))
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout)));
    }

    #[tokio::test]
    async fn test_no_deadline() {
        let result = Deadline::none()
            .run(async { Err::<(), _>(StoreError::NotFound) })
            .await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }
}
