//! Public error taxonomy
//!
//! Every engine operation fails with an [`AuthError`]. Layer errors convert
//! into it through `From` impls. Each variant carries a stable code and an
//! HTTP status for the result envelope; the user-visible code deliberately
//! merges variants that would otherwise leak account or token state.

use http::StatusCode;

use crate::core::db::migration::MigrationError;
use crate::core::db::store::StoreError;
use crate::core::password::HashError;
use crate::core::schema::SchemaError;
use crate::core::storage::StorageError;

/// Authentication error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PasswordPolicy(String),

    #[error("Email already registered")]
    DuplicateEmail,

    #[error("Username already taken")]
    DuplicateUsername,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Email not verified")]
    EmailNotVerified,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid token")]
    TokenInvalid,

    #[error("Token expired")]
    TokenExpired,

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Storage operation timed out")]
    StorageTimeout,

    #[error("Stored credential is malformed")]
    MalformedHash,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) | AuthError::PasswordPolicy(_) => StatusCode::BAD_REQUEST,
            AuthError::DuplicateEmail | AuthError::DuplicateUsername => StatusCode::CONFLICT,
            AuthError::InvalidCredentials
            | AuthError::SessionNotFound
            | AuthError::SessionExpired => StatusCode::UNAUTHORIZED,
            AuthError::TokenInvalid | AuthError::TokenExpired => StatusCode::BAD_REQUEST,
            AuthError::EmailNotVerified => StatusCode::FORBIDDEN,
            AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::StorageTimeout => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Configuration(_) | AuthError::Persistence(_) | AuthError::MalformedHash => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code exposed to clients
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Configuration(_) => "CONFIGURATION_ERROR",
            AuthError::Validation(_) => "VALIDATION_ERROR",
            AuthError::PasswordPolicy(_) => "PASSWORD_POLICY",
            AuthError::DuplicateEmail => "EMAIL_EXISTS",
            AuthError::DuplicateUsername => "USERNAME_EXISTS",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            AuthError::SessionNotFound | AuthError::SessionExpired => "UNAUTHORIZED",
            AuthError::TokenInvalid | AuthError::TokenExpired => "INVALID_TOKEN",
            AuthError::RateLimited { .. } => "RATE_LIMITED",
            AuthError::StorageTimeout => "STORAGE_TIMEOUT",
            AuthError::Persistence(_) | AuthError::MalformedHash => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to clients
    pub fn public_message(&self) -> String {
        match self {
            AuthError::SessionNotFound | AuthError::SessionExpired => {
                "Unauthorized".to_string()
            }
            AuthError::TokenInvalid | AuthError::TokenExpired => {
                "Invalid or expired token".to_string()
            }
            AuthError::Configuration(_) | AuthError::Persistence(_) | AuthError::MalformedHash => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Infrastructure failures, as opposed to caller mistakes
    pub fn is_internal(&self) -> bool {
        self.status().is_server_error()
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::UniqueViolation { column } if column == "email" => {
                AuthError::DuplicateEmail
            }
            StoreError::UniqueViolation { column } if column == "username" => {
                AuthError::DuplicateUsername
            }
            StoreError::Timeout => AuthError::StorageTimeout,
            _ => AuthError::Persistence(err.to_string()),
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Persistence(err.to_string())
    }
}

impl From<HashError> for AuthError {
    fn from(err: HashError) -> Self {
        match err {
            HashError::Malformed(_) => AuthError::MalformedHash,
            HashError::InvalidParams(msg) => AuthError::Configuration(msg),
            HashError::Internal(msg) => AuthError::Persistence(msg),
        }
    }
}

impl From<SchemaError> for AuthError {
    fn from(err: SchemaError) -> Self {
        AuthError::Configuration(err.to_string())
    }
}

impl From<MigrationError> for AuthError {
    fn from(err: MigrationError) -> Self {
        match err.source {
            StoreError::Timeout => AuthError::StorageTimeout,
            _ => AuthError::Configuration(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let dup = |column: &str| StoreError::UniqueViolation {
            column: column.to_string(),
        };
        assert_eq!(AuthError::from(dup("email")), AuthError::DuplicateEmail);
        assert_eq!(AuthError::from(dup("username")), AuthError::DuplicateUsername);
        assert!(matches!(
            AuthError::from(dup("token")),
            AuthError::Persistence(_)
        ));
        assert_eq!(AuthError::from(StoreError::Timeout), AuthError::StorageTimeout);
    }

    #[test]
    fn test_hash_error_conversion() {
        assert_eq!(
            AuthError::from(HashError::Malformed("expected exactly two segments")),
            AuthError::MalformedHash
        );
    }

    #[test]
    fn test_token_failures_are_indistinguishable() {
        let invalid = AuthError::TokenInvalid;
        let expired = AuthError::TokenExpired;
        assert_eq!(invalid.code(), expired.code());
        assert_eq!(invalid.status(), expired.status());
        assert_eq!(invalid.public_message(), expired.public_message());
    }

    #[test]
    fn test_session_failures_are_indistinguishable() {
        let missing = AuthError::SessionNotFound;
        let expired = AuthError::SessionExpired;
        assert_eq!(missing.code(), expired.code());
        assert_eq!(missing.public_message(), expired.public_message());
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::DuplicateEmail.status(), StatusCode::CONFLICT);
        assert_eq!(AuthError::EmailNotVerified.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthError::RateLimited { retry_after_secs: 5 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert!(AuthError::Persistence("db down".into()).is_internal());
        assert!(!AuthError::InvalidCredentials.is_internal());
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = AuthError::Persistence("connection refused at 10.0.0.3".into());
        assert!(!err.public_message().contains("10.0.0.3"));
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
