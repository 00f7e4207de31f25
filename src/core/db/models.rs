//! Database models for the auth tables
//!
//! Entity structs map onto the `user`, `session` and `verification` tables
//! declared in [`crate::core::schema::tables`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// User Model
// ============================================================================

/// User entity representing a registered identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User data for creation (id and timestamps are generated)
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub image: Option<String>,
    pub username: Option<String>,
    pub password_hash: String,
}

impl NewUser {
    /// Columns this insert supplies a value for
    pub fn present_columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["id", "name", "email", "password_hash"];
        if self.image.is_some() {
            columns.push("image");
        }
        if self.username.is_some() {
            columns.push("username");
        }
        columns
    }

    /// Materialize the row with a fresh id and timestamps
    pub fn into_user(self, id: String, now: DateTime<Utc>) -> User {
        User {
            id,
            name: self.name,
            email: self.email,
            email_verified: false,
            image: self.image,
            username: self.username,
            password_hash: Some(self.password_hash),
            created_at: now,
            updated_at: now,
        }
    }
}

/// User data for updates; `None` leaves a column untouched
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub image: Option<String>,
    pub password_hash: Option<String>,
}

impl UserUpdate {
    pub fn email_verified() -> Self {
        Self {
            email_verified: Some(true),
            ..Default::default()
        }
    }

    pub fn password(password_hash: String) -> Self {
        Self {
            password_hash: Some(password_hash),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.email_verified.is_none()
            && self.image.is_none()
            && self.password_hash.is_none()
    }

    /// Apply to an in-memory row
    pub fn apply(&self, user: &mut User, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            user.name = name.clone();
        }
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(verified) = self.email_verified {
            user.email_verified = verified;
        }
        if let Some(image) = &self.image {
            user.image = Some(image.clone());
        }
        if let Some(hash) = &self.password_hash {
            user.password_hash = Some(hash.clone());
        }
        user.updated_at = now;
    }
}

// ============================================================================
// Session Model
// ============================================================================

/// Server-side session; `token` is a bearer credential
#[derive(Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .field("ip_address", &self.ip_address)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// Request metadata recorded on a new session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

// ============================================================================
// Verification Model
// ============================================================================

/// Single-use token record (email verification, password reset, email change)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Verification {
    pub id: String,
    /// `{purpose}:{sha256(token)}`
    pub identifier: String,
    /// JSON payload, see [`VerificationPayload`]
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Verification {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Data carried by a verification row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_user() -> User {
        NewUser {
            name: "A".to_string(),
            email: "a@x.com".to_string(),
            image: None,
            username: None,
            password_hash: "salt:key".to_string(),
        }
        .into_user("user-1".to_string(), Utc::now())
    }

    #[test]
    fn test_user_serialization_hides_password_hash() {
        let json = serde_json::to_string(&sample_user()).unwrap();
        assert!(json.contains("\"email_verified\":false"));
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("salt:key"));
        assert!(!json.contains("username"));
    }

    #[test]
    fn test_new_user_present_columns() {
        let new_user = NewUser {
            name: "A".to_string(),
            email: "a@x.com".to_string(),
            image: Some("https://img".to_string()),
            username: None,
            password_hash: "h".to_string(),
        };
        let columns = new_user.present_columns();
        assert!(columns.contains(&"image"));
        assert!(!columns.contains(&"username"));
    }

    #[test]
    fn test_user_update_apply() {
        let mut user = sample_user();
        let later = user.updated_at + Duration::seconds(5);
        UserUpdate::email_verified().apply(&mut user, later);

        assert!(user.email_verified);
        assert_eq!(user.updated_at, later);
        assert_eq!(user.email, "a@x.com");
        assert!(UserUpdate::default().is_empty());
        assert!(!UserUpdate::password("x".into()).is_empty());
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let now = Utc::now();
        let session = Session {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            token: "very-secret-token".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
            updated_at: now,
            ip_address: None,
            user_agent: None,
        };
        let debug = format!("{:?}", session);
        assert!(!debug.contains("very-secret-token"));
        assert!(debug.contains("<redacted>"));
        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(now + Duration::hours(1)));
    }

    #[test]
    fn test_verification_payload_roundtrip_omits_empty_email() {
        let payload = VerificationPayload {
            user_id: "u1".to_string(),
            new_email: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"user_id":"u1"}"#);
    }
}
