//! Credential flows
//!
//! [`CredentialService`] runs sign-up, sign-in, email verification and the
//! password flows. Input is validated before anything is written. Lookups
//! of unknown accounts still pay for a password verification and return the
//! same error as a wrong password, so responses carry no enumeration signal.
//!
//! Single-use tokens (email verification, email change, password reset) are
//! stored in the `verification` table as `{purpose}:{sha256(token)}`; the raw
//! token is only ever handed to the notifier.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::core::auth::notify::dispatch;
use crate::core::auth::rate_limit::RateLimiter;
use crate::core::auth::session::{SessionManager, generate_token, hash_token};
use crate::core::db::models::{
    NewUser, Session, SessionMetadata, User, UserUpdate, Verification, VerificationPayload,
};
use crate::core::db::store::{Deadline, PrimaryStore, StoreError};
use crate::core::error::AuthError;
use crate::core::options::AuthOptions;
use crate::core::password::{hash_password, verify_password};
use crate::core::schema::SchemaRegistry;

const VERIFY_EMAIL: &str = "verify-email";
const CHANGE_EMAIL: &str = "change-email";
const RESET_PASSWORD: &str = "reset-password";

fn default_true() -> bool {
    true
}

// ============================================================================
// Flow inputs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SignUpEmail {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_true")]
    pub remember_me: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInEmail {
    pub email: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub remember_me: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInUsername {
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub remember_me: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEmail {
    pub new_email: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestPasswordReset {
    pub email: String,
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetPassword {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password: String,
    #[serde(default)]
    pub revoke_other_sessions: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyEmail {
    pub token: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Outcome of a successful sign-up. `session` is `None` when email
/// verification is required before the first sign-in.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: User,
    pub session: Option<Session>,
}

// ============================================================================
// Validation
// ============================================================================

/// Trim and lowercase an email address
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Structural check: `local@domain.tld`, no whitespace
pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let invalid = || AuthError::Validation("Invalid email format".to_string());

    if email.is_empty() || email.len() > 254 || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    if !domain.contains('.') || domain.split('.').any(str::is_empty) {
        return Err(invalid());
    }

    Ok(())
}

// ============================================================================
// Service
// ============================================================================

/// Credential service
#[derive(Clone)]
pub struct CredentialService {
    store: Arc<dyn PrimaryStore>,
    registry: Arc<SchemaRegistry>,
    sessions: SessionManager,
    limiter: RateLimiter,
    options: AuthOptions,
    deadline: Deadline,
    dummy_hash: Arc<OnceCell<String>>,
}

impl CredentialService {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        registry: Arc<SchemaRegistry>,
        sessions: SessionManager,
        options: AuthOptions,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(
                options.secondary_store.clone(),
                options.rate_limit.clone(),
            ),
            deadline: Deadline::new(options.store_timeout),
            store,
            registry,
            sessions,
            options,
            dummy_hash: Arc::new(OnceCell::new()),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn validate_password(&self, password: &str) -> Result<(), AuthError> {
        let len = password.chars().count();
        if len < self.options.min_password_length {
            return Err(AuthError::PasswordPolicy(format!(
                "Password must be at least {} characters",
                self.options.min_password_length
            )));
        }
        if len > self.options.max_password_length {
            return Err(AuthError::PasswordPolicy(format!(
                "Password must be at most {} characters",
                self.options.max_password_length
            )));
        }
        Ok(())
    }

    /// Validate and normalize a username against the plugin rules
    fn validate_username(&self, username: &str) -> Result<String, AuthError> {
        let rules = &self.options.username;
        let len = username.chars().count();
        if len < rules.min_length || len > rules.max_length {
            return Err(AuthError::Validation(format!(
                "Username must be between {} and {} characters",
                rules.min_length, rules.max_length
            )));
        }
        if !rules.is_valid(username) {
            return Err(AuthError::Validation("Invalid username format".to_string()));
        }
        Ok(rules.normalize(username))
    }

    /// Callback and redirect URLs must point at a trusted origin
    pub(crate) fn check_redirect(&self, url: Option<&str>) -> Result<(), AuthError> {
        match url {
            Some(url) if !self.options.is_trusted_redirect(url) => {
                tracing::warn!("Rejected untrusted redirect target");
                Err(AuthError::Validation("Invalid callback URL".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn require_email_and_password(&self) -> Result<(), AuthError> {
        if self.options.email_and_password_enabled {
            Ok(())
        } else {
            Err(AuthError::Validation(
                "Email and password authentication is disabled".to_string(),
            ))
        }
    }

    async fn hash(&self, password: &str) -> Result<String, AuthError> {
        Ok(hash_password(self.options.hasher.clone(), password.to_string()).await?)
    }

    async fn verify(&self, password: &str, encoded: &str) -> Result<bool, AuthError> {
        Ok(verify_password(
            self.options.hasher.clone(),
            password.to_string(),
            encoded.to_string(),
        )
        .await?)
    }

    /// Spend the same work as a real verification, then fail
    async fn reject_unknown(&self, password: &str) -> AuthError {
        let dummy = self
            .dummy_hash
            .get_or_try_init(|| self.hash("authengine-dummy-password"))
            .await;
        if let Ok(dummy) = dummy {
            let _ = self.verify(password, dummy).await;
        }
        AuthError::InvalidCredentials
    }

    // ========================================================================
    // Sign-up
    // ========================================================================

    pub async fn sign_up_email(
        &self,
        input: SignUpEmail,
        metadata: SessionMetadata,
    ) -> Result<SignUpOutcome, AuthError> {
        self.require_email_and_password()?;
        self.check_redirect(input.callback_url.as_deref())?;

        let email = normalize_email(&input.email);
        validate_email(&email)?;
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(AuthError::Validation("Name is required".to_string()));
        }
        self.validate_password(&input.password)?;

        let username = match (&input.username, self.options.username.enabled) {
            (Some(username), true) => Some(self.validate_username(username.trim())?),
            (None, true) => None,
            (Some(_), false) => {
                tracing::debug!("Ignoring username on sign-up: username plugin disabled");
                None
            }
            (None, false) => None,
        };

        let new_user = NewUser {
            name,
            email,
            image: input.image.filter(|i| !i.trim().is_empty()),
            username,
            password_hash: String::new(),
        };
        if let Some(column) = self
            .registry
            .missing_required(&self.options.tables.user, &new_user.present_columns())?
        {
            return Err(AuthError::Validation(format!("Field '{}' is required", column)));
        }

        // Best-effort pre-checks; the store's unique constraints decide
        if self
            .deadline
            .run(self.store.find_user_by_email(&new_user.email))
            .await?
            .is_some()
        {
            return Err(AuthError::DuplicateEmail);
        }
        if let Some(username) = &new_user.username
            && self
                .deadline
                .run(self.store.find_user_by_username(username))
                .await?
                .is_some()
        {
            return Err(AuthError::DuplicateUsername);
        }

        let new_user = NewUser {
            password_hash: self.hash(&input.password).await?,
            ..new_user
        };
        let id = Uuid::new_v4().to_string();
        let user = self
            .deadline
            .run(self.store.insert_user(&id, &new_user))
            .await?;

        tracing::info!("User signed up: {}", user.id);

        if self.options.send_verification_on_sign_up || self.options.require_email_verification {
            self.send_verification_email(&user, input.callback_url.as_deref())
                .await;
        }

        let session = if self.options.require_email_verification {
            None
        } else {
            Some(
                self.sessions
                    .create(&user.id, metadata, input.remember_me)
                    .await?,
            )
        };

        Ok(SignUpOutcome { user, session })
    }

    // ========================================================================
    // Sign-in
    // ========================================================================

    pub async fn sign_in_email(
        &self,
        input: SignInEmail,
        metadata: SessionMetadata,
    ) -> Result<(User, Session), AuthError> {
        self.require_email_and_password()?;
        self.check_redirect(input.callback_url.as_deref())?;

        let email = normalize_email(&input.email);
        self.limiter.check("sign-in", &email).await?;
        if validate_email(&email).is_err() {
            return Err(self.reject_unknown(&input.password).await);
        }

        let user = self
            .deadline
            .run(self.store.find_user_by_email(&email))
            .await?;
        self.complete_sign_in(
            user,
            &input.password,
            input.remember_me,
            metadata,
            input.callback_url.as_deref(),
        )
        .await
    }

    pub async fn sign_in_username(
        &self,
        input: SignInUsername,
        metadata: SessionMetadata,
    ) -> Result<(User, Session), AuthError> {
        if !self.options.username.enabled {
            return Err(AuthError::Validation(
                "Username sign-in is not enabled".to_string(),
            ));
        }

        self.check_redirect(input.callback_url.as_deref())?;

        let username = self.options.username.normalize(input.username.trim());
        self.limiter.check("sign-in", &username).await?;

        let user = self
            .deadline
            .run(self.store.find_user_by_username(&username))
            .await?;
        self.complete_sign_in(
            user,
            &input.password,
            input.remember_me,
            metadata,
            input.callback_url.as_deref(),
        )
        .await
    }

    async fn complete_sign_in(
        &self,
        user: Option<User>,
        password: &str,
        remember_me: bool,
        metadata: SessionMetadata,
        callback_url: Option<&str>,
    ) -> Result<(User, Session), AuthError> {
        let Some(user) = user else {
            return Err(self.reject_unknown(password).await);
        };
        let Some(hash) = user.password_hash.as_deref() else {
            return Err(self.reject_unknown(password).await);
        };

        if !self.verify(password, hash).await? {
            tracing::debug!("Password mismatch for user {}", user.id);
            return Err(AuthError::InvalidCredentials);
        }

        if self.options.require_email_verification && !user.email_verified {
            self.send_verification_email(&user, callback_url).await;
            return Err(AuthError::EmailNotVerified);
        }

        let session = self.sessions.create(&user.id, metadata, remember_me).await?;
        tracing::info!("User signed in: {}", user.id);
        Ok((user, session))
    }

    // ========================================================================
    // Sign-out
    // ========================================================================

    /// Revoke the session behind `token`. A missing, unknown or expired
    /// session is already signed out, so this returns `Ok(false)` for it.
    /// The notifier's sign-out hook runs once per successful call; it does
    /// not run when the revoke fails.
    pub async fn sign_out(&self, token: Option<&str>) -> Result<bool, AuthError> {
        let session = match token {
            Some(token) => match self.sessions.resolve(token).await {
                Ok(session) => Some(session),
                Err(AuthError::SessionNotFound | AuthError::SessionExpired) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let revoked = match &session {
            Some(session) => {
                let revoked = self.sessions.revoke(&session.id).await?;
                tracing::info!("User signed out: {}", session.user_id);
                revoked
            }
            None => false,
        };

        let user_id = session.as_ref().map_or("anonymous", |s| s.user_id.as_str());
        dispatch(
            "sign-out",
            user_id,
            self.options.notifier.on_sign_out(session.as_ref()),
        )
        .await;
        Ok(revoked)
    }

    // ========================================================================
    // Email verification and change
    // ========================================================================

    async fn send_verification_email(&self, user: &User, callback_url: Option<&str>) {
        let payload = VerificationPayload {
            user_id: user.id.clone(),
            new_email: None,
        };
        let token = match self
            .issue_token(VERIFY_EMAIL, &payload, self.options.verification_token_ttl)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Failed to issue verification token for {}: {}", user.id, e);
                return;
            }
        };

        let url = self.verify_url(&token, callback_url);
        dispatch(
            "verification",
            &user.id,
            self.options.notifier.send_verification_email(user, &url, &token),
        )
        .await;
    }

    fn verify_url(&self, token: &str, callback_url: Option<&str>) -> String {
        let mut url = format!(
            "{}/api/auth/verify-email?token={}",
            self.options.base_url.trim_end_matches('/'),
            token
        );
        if let Some(callback) = callback_url {
            url.push_str("&callback_url=");
            url.push_str(&urlencoding::encode(callback));
        }
        url
    }

    /// Start an email change. The new address takes effect once the link
    /// sent to it is followed.
    pub async fn change_email(&self, session: &Session, input: ChangeEmail) -> Result<(), AuthError> {
        self.check_redirect(input.callback_url.as_deref())?;
        let new_email = normalize_email(&input.new_email);
        validate_email(&new_email)?;

        let user = self
            .deadline
            .run(self.store.find_user_by_id(&session.user_id))
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        if user.email == new_email {
            return Err(AuthError::Validation(
                "New email is the same as the current email".to_string(),
            ));
        }
        if self
            .deadline
            .run(self.store.find_user_by_email(&new_email))
            .await?
            .is_some()
        {
            return Err(AuthError::DuplicateEmail);
        }

        let payload = VerificationPayload {
            user_id: user.id.clone(),
            new_email: Some(new_email.clone()),
        };
        let token = self
            .issue_token(CHANGE_EMAIL, &payload, self.options.verification_token_ttl)
            .await?;
        let url = self.verify_url(&token, input.callback_url.as_deref());

        dispatch(
            "change-email",
            &user.id,
            self.options
                .notifier
                .send_change_email_verification(&user, &new_email, &url, &token),
        )
        .await;

        tracing::info!("Email change requested for user {}", user.id);
        Ok(())
    }

    /// Consume a verification or email-change token
    pub async fn verify_email(&self, token: &str) -> Result<User, AuthError> {
        let (purpose, payload) = match self.consume_token(VERIFY_EMAIL, token).await {
            Err(AuthError::TokenInvalid) => (
                CHANGE_EMAIL,
                self.consume_token(CHANGE_EMAIL, token).await?,
            ),
            other => (VERIFY_EMAIL, other?),
        };

        let user = self
            .deadline
            .run(self.store.find_user_by_id(&payload.user_id))
            .await?
            .ok_or(AuthError::TokenInvalid)?;

        let update = match (purpose, payload.new_email) {
            (CHANGE_EMAIL, Some(new_email)) => UserUpdate {
                email: Some(new_email),
                email_verified: Some(true),
                ..Default::default()
            },
            _ if user.email_verified => return Ok(user),
            _ => UserUpdate::email_verified(),
        };

        let user = self
            .deadline
            .run(self.store.update_user(&user.id, &update))
            .await?;
        tracing::info!("Email verified for user {}", user.id);
        Ok(user)
    }

    // ========================================================================
    // Password flows
    // ========================================================================

    /// Always succeeds for well-formed input, whether or not the address is
    /// registered.
    pub async fn request_password_reset(&self, input: RequestPasswordReset) -> Result<(), AuthError> {
        let email = normalize_email(&input.email);
        validate_email(&email)?;
        self.check_redirect(input.redirect_to.as_deref())?;
        self.limiter.check("reset-password", &email).await?;

        let Some(user) = self
            .deadline
            .run(self.store.find_user_by_email(&email))
            .await?
        else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };

        let payload = VerificationPayload {
            user_id: user.id.clone(),
            new_email: None,
        };
        let token = self
            .issue_token(RESET_PASSWORD, &payload, self.options.reset_token_ttl)
            .await?;

        let url = match input.redirect_to.as_deref() {
            Some(redirect) => {
                let separator = if redirect.contains('?') { '&' } else { '?' };
                // Links leave the site, so paths are anchored to the public origin
                let origin = if redirect.starts_with('/') {
                    self.options.base_url.trim_end_matches('/')
                } else {
                    ""
                };
                format!("{}{}{}token={}", origin, redirect, separator, token)
            }
            None => format!(
                "{}/reset-password?token={}",
                self.options.base_url.trim_end_matches('/'),
                token
            ),
        };

        dispatch(
            "reset-password",
            &user.id,
            self.options.notifier.send_reset_password(&user, &url, &token),
        )
        .await;

        tracing::info!("Password reset requested for user {}", user.id);
        Ok(())
    }

    pub async fn reset_password(&self, input: ResetPassword) -> Result<(), AuthError> {
        self.validate_password(&input.new_password)?;
        let payload = self.consume_token(RESET_PASSWORD, &input.token).await?;

        let hash = self.hash(&input.new_password).await?;
        let user = self
            .deadline
            .run(self.store.update_user(&payload.user_id, &UserUpdate::password(hash)))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => AuthError::TokenInvalid,
                other => other.into(),
            })?;

        dispatch(
            "password-change",
            &user.id,
            self.options.notifier.on_password_change(&user),
        )
        .await;

        tracing::info!("Password reset for user {}", user.id);
        Ok(())
    }

    pub async fn change_password(
        &self,
        session: &Session,
        input: ChangePassword,
    ) -> Result<(), AuthError> {
        self.validate_password(&input.new_password)?;

        let user = self
            .deadline
            .run(self.store.find_user_by_id(&session.user_id))
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        let Some(current) = user.password_hash.as_deref() else {
            return Err(AuthError::InvalidCredentials);
        };
        if !self.verify(&input.current_password, current).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let hash = self.hash(&input.new_password).await?;
        let user = self
            .deadline
            .run(self.store.update_user(&user.id, &UserUpdate::password(hash)))
            .await?;

        if input.revoke_other_sessions {
            self.sessions
                .revoke_all_for_user(&user.id, Some(&session.id))
                .await?;
        }

        dispatch(
            "password-change",
            &user.id,
            self.options.notifier.on_password_change(&user),
        )
        .await;

        tracing::info!("Password changed for user {}", user.id);
        Ok(())
    }

    // ========================================================================
    // Single-use tokens
    // ========================================================================

    async fn issue_token(
        &self,
        purpose: &str,
        payload: &VerificationPayload,
        ttl: std::time::Duration,
    ) -> Result<String, AuthError> {
        let token = generate_token();
        let now = Utc::now();
        let value = serde_json::to_string(payload)
            .map_err(|e| AuthError::Persistence(e.to_string()))?;

        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| AuthError::Configuration("token lifetime overflows".to_string()))?;

        let verification = Verification {
            id: Uuid::new_v4().to_string(),
            identifier: format!("{}:{}", purpose, hash_token(&token)),
            value,
            expires_at,
            created_at: now,
            updated_at: now,
        };
        self.deadline
            .run(self.store.insert_verification(&verification))
            .await?;

        Ok(token)
    }

    /// Look up, check and delete a token. Deletion happens before the caller
    /// acts on it, so a token can be used at most once.
    async fn consume_token(
        &self,
        purpose: &str,
        token: &str,
    ) -> Result<VerificationPayload, AuthError> {
        if token.is_empty() {
            return Err(AuthError::TokenInvalid);
        }

        let identifier = format!("{}:{}", purpose, hash_token(token));
        let verification = self
            .deadline
            .run(self.store.find_verification(&identifier))
            .await?
            .ok_or(AuthError::TokenInvalid)?;

        let deleted = self
            .deadline
            .run(self.store.delete_verification(&verification.id))
            .await?;

        if verification.is_expired_at(Utc::now()) {
            return Err(AuthError::TokenExpired);
        }
        if !deleted {
            // Consumed concurrently
            return Err(AuthError::TokenInvalid);
        }

        serde_json::from_str(&verification.value).map_err(|_| AuthError::TokenInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_email() {
        assert!(validate_email("a@x.com").is_ok());
        assert!(validate_email("first.last@sub.example.org").is_ok());

        for bad in ["", "plain", "@x.com", "a@", "a@x", "a@x.", "a@.com", "a b@x.com", "a@b@x.com"] {
            assert!(validate_email(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  A@X.Com "), "a@x.com");
    }

    #[test]
    fn test_sign_up_defaults() {
        let input: SignUpEmail = serde_json::from_str(
            r#"{"email":"a@x.com","password":"longenough1","name":"A"}"#,
        )
        .unwrap();
        assert!(input.remember_me);
        assert!(input.username.is_none());
        assert!(input.callback_url.is_none());
    }

    #[test]
    fn test_change_password_defaults() {
        let input: ChangePassword = serde_json::from_str(
            r#"{"current_password":"a","new_password":"b"}"#,
        )
        .unwrap();
        assert!(!input.revoke_other_sessions);
    }
}
