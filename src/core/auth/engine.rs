//! Auth engine facade
//!
//! [`AuthEngine`] is the contract a transport consumes. Construction
//! validates options, resolves the schema, migrates the primary store and
//! binds it to the configured table names;
//! each operation takes a decoded body plus the inbound headers and
//! returns an [`AuthResult`].

use std::sync::Arc;

use http::HeaderMap;
use serde::Serialize;

use crate::core::auth::credential::{
    ChangeEmail, ChangePassword, CredentialService, RequestPasswordReset, ResetPassword,
    SignInEmail, SignInUsername, SignUpEmail, VerifyEmail,
};
use crate::core::auth::result::{
    AuthResult, clear_session_cookie, extract_token, request_metadata, session_cookie,
};
use crate::core::auth::session::SessionManager;
use crate::core::db::migration::{MigrationRunner, MigrationTarget};
use crate::core::db::models::{Session, User};
use crate::core::db::store::{Deadline, PrimaryStore};
use crate::core::error::AuthError;
use crate::core::options::AuthOptions;
use crate::core::schema::{SchemaRegistry, auth_schema};

// ============================================================================
// Response bodies
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SignUpResponse {
    /// `None` when email verification gates the first session
    pub token: Option<String>,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignInResponse {
    pub redirect: bool,
    pub token: String,
    pub url: Option<String>,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub session: Session,
    pub user: User,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    fn ok() -> Self {
        Self {
            status: true,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEmailResponse {
    pub status: bool,
    pub user: User,
}

// ============================================================================
// Engine
// ============================================================================

/// Authentication engine
#[derive(Clone)]
pub struct AuthEngine {
    store: Arc<dyn PrimaryStore>,
    registry: Arc<SchemaRegistry>,
    sessions: SessionManager,
    credentials: CredentialService,
    options: AuthOptions,
}

impl AuthEngine {
    /// Validate options, migrate `store` and compose the services
    pub async fn new<S>(store: Arc<S>, options: AuthOptions) -> Result<Self, AuthError>
    where
        S: PrimaryStore + 'static,
    {
        options.validate()?;

        let registry = Arc::new(auth_schema(&options.tables, options.username.enabled)?);
        let report = MigrationRunner::new(&registry).run(store.as_ref()).await?;
        if report.is_noop() {
            tracing::info!("Auth schema is up to date");
        } else {
            tracing::info!("Applied {} auth schema statement(s)", report.applied.len());
        }
        store.bind_schema(&options.tables, &registry);

        let store: Arc<dyn PrimaryStore> = store;
        let sessions = SessionManager::new(store.clone(), &options);
        let credentials = CredentialService::new(
            store.clone(),
            registry.clone(),
            sessions.clone(),
            options.clone(),
        );

        Ok(Self {
            store,
            registry,
            sessions,
            credentials,
            options,
        })
    }

    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Session and user for the bearer token carried by `headers`
    async fn authenticate(&self, headers: &HeaderMap) -> Result<(Session, User), AuthError> {
        let token =
            extract_token(headers, &self.options.cookie_name).ok_or(AuthError::SessionNotFound)?;
        let session = self.sessions.resolve(&token).await?;

        let user = Deadline::new(self.options.store_timeout)
            .run(self.store.find_user_by_id(&session.user_id))
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        Ok((session, user))
    }

    // ========================================================================
    // Sign-up / sign-in / sign-out
    // ========================================================================

    pub async fn sign_up_email(
        &self,
        input: SignUpEmail,
        headers: &HeaderMap,
    ) -> AuthResult<SignUpResponse> {
        let remember_me = input.remember_me;
        let outcome = match self
            .credentials
            .sign_up_email(input, request_metadata(headers))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return AuthResult::error(&e),
        };

        match outcome.session {
            Some(session) => AuthResult::ok(SignUpResponse {
                token: Some(session.token.clone()),
                user: outcome.user,
            })
            .set_cookie(&session_cookie(&self.options, &session, remember_me)),
            None => AuthResult::ok(SignUpResponse {
                token: None,
                user: outcome.user,
            }),
        }
    }

    pub async fn sign_in_email(
        &self,
        input: SignInEmail,
        headers: &HeaderMap,
    ) -> AuthResult<SignInResponse> {
        let remember_me = input.remember_me;
        let url = input.callback_url.clone();
        let result = self
            .credentials
            .sign_in_email(input, request_metadata(headers))
            .await;
        self.signed_in(result, remember_me, url)
    }

    pub async fn sign_in_username(
        &self,
        input: SignInUsername,
        headers: &HeaderMap,
    ) -> AuthResult<SignInResponse> {
        let remember_me = input.remember_me;
        let url = input.callback_url.clone();
        let result = self
            .credentials
            .sign_in_username(input, request_metadata(headers))
            .await;
        self.signed_in(result, remember_me, url)
    }

    fn signed_in(
        &self,
        result: Result<(User, Session), AuthError>,
        remember_me: bool,
        url: Option<String>,
    ) -> AuthResult<SignInResponse> {
        match result {
            Ok((user, session)) => AuthResult::ok(SignInResponse {
                redirect: url.is_some(),
                token: session.token.clone(),
                url,
                user,
            })
            .set_cookie(&session_cookie(&self.options, &session, remember_me)),
            Err(e) => AuthResult::error(&e),
        }
    }

    /// Clears the cookie and succeeds whether or not a session existed.
    /// A failed revoke is reported and leaves the cookie in place.
    pub async fn sign_out(&self, headers: &HeaderMap) -> AuthResult<SuccessResponse> {
        let token = extract_token(headers, &self.options.cookie_name);
        match self.credentials.sign_out(token.as_deref()).await {
            Ok(_) => AuthResult::ok(SuccessResponse { success: true })
                .set_cookie(&clear_session_cookie(&self.options)),
            Err(e) => AuthResult::error(&e),
        }
    }

    pub async fn get_session(&self, headers: &HeaderMap) -> AuthResult<SessionResponse> {
        AuthResult::from_result(
            self.authenticate(headers)
                .await
                .map(|(session, user)| SessionResponse { session, user }),
        )
    }

    // ========================================================================
    // Account changes
    // ========================================================================

    pub async fn change_email(
        &self,
        input: ChangeEmail,
        headers: &HeaderMap,
    ) -> AuthResult<StatusResponse> {
        let result = match self.authenticate(headers).await {
            Ok((session, _)) => self.credentials.change_email(&session, input).await,
            Err(e) => Err(e),
        };
        AuthResult::from_result(result.map(|_| StatusResponse {
            status: true,
            message: Some("Verification email sent to the new address".to_string()),
        }))
    }

    pub async fn request_password_reset(
        &self,
        input: RequestPasswordReset,
    ) -> AuthResult<StatusResponse> {
        let result = self.credentials.request_password_reset(input).await;
        AuthResult::from_result(result.map(|_| StatusResponse {
            status: true,
            message: Some(
                "If this email exists in our system, check your email for the reset link"
                    .to_string(),
            ),
        }))
    }

    pub async fn reset_password(&self, input: ResetPassword) -> AuthResult<StatusResponse> {
        let result = self.credentials.reset_password(input).await;
        AuthResult::from_result(result.map(|_| StatusResponse::ok()))
    }

    pub async fn change_password(
        &self,
        input: ChangePassword,
        headers: &HeaderMap,
    ) -> AuthResult<StatusResponse> {
        let result = match self.authenticate(headers).await {
            Ok((session, _)) => self.credentials.change_password(&session, input).await,
            Err(e) => Err(e),
        };
        AuthResult::from_result(result.map(|_| StatusResponse::ok()))
    }

    /// Confirm an address. With a `callback_url` the result is a redirect;
    /// an untrusted one is rejected before the token is consumed.
    pub async fn verify_email(&self, input: VerifyEmail) -> AuthResult<VerifyEmailResponse> {
        if let Err(e) = self
            .credentials
            .check_redirect(input.callback_url.as_deref())
        {
            return AuthResult::error(&e);
        }

        let callback = input.callback_url.clone();
        let result = AuthResult::from_result(
            self.credentials
                .verify_email(&input.token)
                .await
                .map(|user| VerifyEmailResponse { status: true, user }),
        );

        match callback {
            Some(url) if result.is_success() => result.redirect(&url),
            _ => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::MemoryStore;
    use crate::core::options::UsernameOptions;
    use crate::core::password::ScryptHasher;
    use crate::core::schema::{TableNames, USER_TABLE};
    use http::{HeaderValue, StatusCode, header};

    fn options() -> AuthOptions {
        AuthOptions::default().hasher(ScryptHasher::with_params(4, 8, 1).unwrap())
    }

    fn sign_up(email: &str) -> SignUpEmail {
        SignUpEmail {
            email: email.to_string(),
            password: "password123".to_string(),
            name: "Test".to_string(),
            image: None,
            username: None,
            remember_me: true,
            callback_url: None,
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_new_migrates_store() {
        let store = Arc::new(MemoryStore::new());
        let engine = AuthEngine::new(store.clone(), options()).await.unwrap();
        assert!(engine.registry().model(USER_TABLE).is_some());
        assert!(!engine.registry().has_field(USER_TABLE, "username"));

        // Second construction finds nothing to do
        assert!(AuthEngine::new(store, options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_options() {
        let store = Arc::new(MemoryStore::new());
        let result = AuthEngine::new(store, options().password_length(10, 5)).await;
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_username_enabled_extends_schema() {
        let store = Arc::new(MemoryStore::new());
        let engine = AuthEngine::new(store, options().username(UsernameOptions::enabled()))
            .await
            .unwrap();
        assert!(engine.registry().has_field(USER_TABLE, "username"));
    }

    #[tokio::test]
    async fn test_sign_up_sets_cookie() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();
        let result = engine.sign_up_email(sign_up("a@x.com"), &HeaderMap::new()).await;

        assert_eq!(result.status, StatusCode::OK);
        let cookie = result.headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        let token = result.data().unwrap().token.clone().unwrap();
        assert!(cookie.contains(&token));

        let json = serde_json::to_value(&result.body).unwrap();
        assert_eq!(json["user"]["email"], "a@x.com");
        assert!(json["user"].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn test_get_session_with_bearer_and_cookie() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();
        let token = engine
            .sign_up_email(sign_up("a@x.com"), &HeaderMap::new())
            .await
            .into_data()
            .unwrap()
            .token
            .unwrap();

        let result = engine.get_session(&bearer(&token)).await;
        assert_eq!(result.data().unwrap().user.email, "a@x.com");

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("auth.session_token={}", token)).unwrap(),
        );
        assert!(engine.get_session(&headers).await.is_success());
    }

    #[tokio::test]
    async fn test_get_session_without_token() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();
        let result = engine.get_session(&HeaderMap::new()).await;
        assert_eq!(result.status, StatusCode::UNAUTHORIZED);
        assert_eq!(result.into_data().unwrap_err().code, "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_sign_out_clears_cookie_and_is_idempotent() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();
        let token = engine
            .sign_up_email(sign_up("a@x.com"), &HeaderMap::new())
            .await
            .into_data()
            .unwrap()
            .token
            .unwrap();

        let first = engine.sign_out(&bearer(&token)).await;
        assert!(first.is_success());
        let cookie = first.headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.contains("Max-Age=0"));

        assert!(engine.sign_out(&bearer(&token)).await.is_success());
        assert!(engine.sign_out(&HeaderMap::new()).await.is_success());
        assert!(!engine.get_session(&bearer(&token)).await.is_success());
    }

    #[tokio::test]
    async fn test_sign_in_reports_callback() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();
        engine.sign_up_email(sign_up("a@x.com"), &HeaderMap::new()).await;

        let result = engine
            .sign_in_email(
                SignInEmail {
                    email: "a@x.com".to_string(),
                    password: "password123".to_string(),
                    remember_me: false,
                    callback_url: Some("/dashboard".to_string()),
                },
                &HeaderMap::new(),
            )
            .await;
        let data = result.data().unwrap();
        assert!(data.redirect);
        assert_eq!(data.url.as_deref(), Some("/dashboard"));

        let cookie = result.headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(!cookie.contains("Max-Age"));
    }

    #[tokio::test]
    async fn test_verify_email_bad_token() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();
        let result = engine
            .verify_email(VerifyEmail {
                token: "nope".to_string(),
                callback_url: Some("/welcome".to_string()),
            })
            .await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert!(result.headers.get(header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn test_untrusted_callbacks_are_rejected() {
        let engine = AuthEngine::new(Arc::new(MemoryStore::new()), options())
            .await
            .unwrap();

        let result = engine
            .verify_email(VerifyEmail {
                token: "nope".to_string(),
                callback_url: Some("https://evil.example.com/phish".to_string()),
            })
            .await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
        assert_eq!(result.into_data().unwrap_err().code, "VALIDATION_ERROR");

        let mut input = sign_up("a@x.com");
        input.callback_url = Some("//evil.example.com".to_string());
        let result = engine.sign_up_email(input, &HeaderMap::new()).await;
        assert_eq!(result.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_custom_table_names() {
        let store = Arc::new(MemoryStore::new());
        let tables = TableNames::default().user("accounts").session("logins");
        let engine = AuthEngine::new(store.clone(), options().tables(tables))
            .await
            .unwrap();
        assert!(engine.registry().model("accounts").is_some());
        assert!(engine.registry().model(USER_TABLE).is_none());

        let token = engine
            .sign_up_email(sign_up("a@x.com"), &HeaderMap::new())
            .await
            .into_data()
            .unwrap()
            .token
            .unwrap();
        assert!(engine.get_session(&bearer(&token)).await.is_success());
        assert!(store.existing_columns("logins").await.unwrap().is_some());
        assert!(store.existing_columns("session").await.unwrap().is_none());
    }
}
