//! Result envelope
//!
//! Every [`AuthEngine`](crate::core::auth::AuthEngine) operation returns an
//! [`AuthResult`]: a JSON-serializable body, header directives and a status
//! code. A transport writes the three verbatim. Business errors become an
//! [`ErrorBody`] with the status and code from [`AuthError`].

use chrono::Utc;
use cookie::{Cookie, SameSite};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use serde::Serialize;

use crate::core::db::models::{Session, SessionMetadata};
use crate::core::error::AuthError;
use crate::core::options::AuthOptions;

/// Error payload written for failed operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl From<&AuthError> for ErrorBody {
    fn from(err: &AuthError) -> Self {
        Self::new(err.public_message(), err.code())
    }
}

/// Response body: operation payload or error
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Body<T> {
    Data(T),
    Error(ErrorBody),
}

/// Transport-agnostic operation result
#[derive(Debug, Clone)]
pub struct AuthResult<T> {
    pub body: Body<T>,
    pub headers: HeaderMap,
    pub status: StatusCode,
}

impl<T> AuthResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            body: Body::Data(data),
            headers: HeaderMap::new(),
            status: StatusCode::OK,
        }
    }

    pub fn error(err: &AuthError) -> Self {
        if err.is_internal() {
            tracing::error!("Auth operation failed: {}", err);
        } else {
            tracing::debug!("Auth operation rejected: {}", err);
        }

        let mut headers = HeaderMap::new();
        if let AuthError::RateLimited { retry_after_secs } = err {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }

        Self {
            body: Body::Error(err.into()),
            headers,
            status: err.status(),
        }
    }

    pub fn from_result(result: Result<T, AuthError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::error(&e),
        }
    }

    /// Append a `Set-Cookie` directive
    pub fn set_cookie(mut self, cookie: &Cookie<'_>) -> Self {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                self.headers.append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!("Dropping unencodable cookie {}: {}", cookie.name(), e),
        }
        self
    }

    /// Redirect with 302 to `location`
    pub fn redirect(mut self, location: &str) -> Self {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                self.headers.insert(header::LOCATION, value);
                self.status = StatusCode::FOUND;
            }
            Err(e) => tracing::warn!("Ignoring invalid redirect target: {}", e),
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.body, Body::Data(_))
    }

    pub fn data(&self) -> Option<&T> {
        match &self.body {
            Body::Data(data) => Some(data),
            Body::Error(_) => None,
        }
    }

    pub fn into_data(self) -> Result<T, ErrorBody> {
        match self.body {
            Body::Data(data) => Ok(data),
            Body::Error(err) => Err(err),
        }
    }
}

// ============================================================================
// Cookies and bearer tokens
// ============================================================================

/// Session cookie for `session`. Without `remember_me` the cookie has no
/// `Max-Age` and ends with the browser session.
pub fn session_cookie(options: &AuthOptions, session: &Session, remember_me: bool) -> Cookie<'static> {
    let mut cookie = Cookie::build((options.cookie_name.clone(), session.token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(options.secure_cookies)
        .build();

    if remember_me {
        let max_age = (session.expires_at - Utc::now()).num_seconds().max(0);
        cookie.set_max_age(cookie::time::Duration::seconds(max_age));
    }
    cookie
}

/// Expired cookie that makes the client drop its session token
pub fn clear_session_cookie(options: &AuthOptions) -> Cookie<'static> {
    let mut cookie = Cookie::build((options.cookie_name.clone(), ""))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(options.secure_cookies)
        .build();
    cookie.make_removal();
    cookie
}

/// Bearer token from `Authorization: Bearer`, else from the session cookie
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|c| c.name() == cookie_name && !c.value().is_empty())
        .map(|c| c.value().to_string())
}

/// Client address and user agent recorded on new sessions
pub fn request_metadata(headers: &HeaderMap) -> SessionMetadata {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    SessionMetadata {
        ip_address: header_str("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .or_else(|| header_str("x-real-ip").map(str::to_string)),
        user_agent: header_str("user-agent").map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: "s1".to_string(),
            user_id: "u1".to_string(),
            token: "abc123".to_string(),
            created_at: now,
            expires_at: now + TimeDelta::days(7),
            updated_at: now,
            ip_address: None,
            user_agent: None,
        }
    }

    #[test]
    fn test_ok_envelope() {
        let result = AuthResult::ok(serde_json::json!({"status": true}));
        assert!(result.is_success());
        assert_eq!(result.status, StatusCode::OK);
        assert!(result.headers.is_empty());
        assert_eq!(
            serde_json::to_string(&result.body).unwrap(),
            r#"{"status":true}"#
        );
    }

    #[test]
    fn test_error_envelope() {
        let result: AuthResult<()> = AuthResult::error(&AuthError::InvalidCredentials);
        assert!(!result.is_success());
        assert_eq!(result.status, StatusCode::UNAUTHORIZED);
        let body = result.into_data().unwrap_err();
        assert_eq!(body.code, "INVALID_CREDENTIALS");
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let err = AuthError::Persistence("connection reset by 10.0.0.3".to_string());
        let result: AuthResult<()> = AuthResult::error(&err);
        assert_eq!(result.status, StatusCode::INTERNAL_SERVER_ERROR);
        let json = serde_json::to_string(&result.body).unwrap();
        assert!(!json.contains("10.0.0.3"));
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let result: AuthResult<()> =
            AuthResult::error(&AuthError::RateLimited { retry_after_secs: 42 });
        assert_eq!(result.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(result.headers.get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_redirect_is_the_only_status_override() {
        let result = AuthResult::ok(()).redirect("https://app.example.com/welcome");
        assert_eq!(result.status, StatusCode::FOUND);
        assert_eq!(
            result.headers.get(header::LOCATION).unwrap(),
            "https://app.example.com/welcome"
        );

        let result = AuthResult::ok(()).redirect("bad\nlocation");
        assert_eq!(result.status, StatusCode::OK);
        assert!(result.headers.get(header::LOCATION).is_none());
    }

    #[test]
    fn test_session_cookie_attributes() {
        let options = AuthOptions::default();
        let cookie = session_cookie(&options, &session(), true).to_string();
        assert!(cookie.starts_with("auth.session_token=abc123"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Max-Age="));
        assert!(!cookie.contains("Secure"));

        let cookie = session_cookie(&options, &session(), false).to_string();
        assert!(!cookie.contains("Max-Age"));
    }

    #[test]
    fn test_clear_cookie() {
        let cookie = clear_session_cookie(&AuthOptions::default()).to_string();
        assert!(cookie.starts_with("auth.session_token=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn test_set_cookie_header() {
        let options = AuthOptions::default();
        let result = AuthResult::ok(()).set_cookie(&session_cookie(&options, &session(), true));
        let value = result.headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(value.starts_with("auth.session_token=abc123"));
    }

    #[test]
    fn test_extract_token_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(extract_token(&headers, "auth.session_token").as_deref(), Some("tok"));
    }

    #[test]
    fn test_extract_token_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; auth.session_token=tok2"),
        );
        assert_eq!(extract_token(&headers, "auth.session_token").as_deref(), Some("tok2"));
    }

    #[test]
    fn test_extract_token_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, "auth.session_token"), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("auth.session_token="));
        assert_eq!(extract_token(&headers, "auth.session_token"), None);
    }

    #[test]
    fn test_request_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));

        let metadata = request_metadata(&headers);
        assert_eq!(metadata.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(metadata.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(request_metadata(&HeaderMap::new()), SessionMetadata::default());
    }
}
