//! Engine configuration
//!
//! [`AuthOptions`] is the full configuration surface of the engine. Every
//! field has a default; collaborators (hasher, secondary store, notifier)
//! are injected as trait objects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::auth::notify::{Notifier, TracingNotifier};
use crate::core::error::AuthError;
use crate::core::password::{PasswordHasher, ScryptHasher};
use crate::core::schema::TableNames;
use crate::core::storage::{SecondaryStore, TtlMemoryStorage};

pub type UsernameValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type UsernameNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Username sign-in plugin
#[derive(Clone)]
pub struct UsernameOptions {
    pub enabled: bool,
    pub min_length: usize,
    pub max_length: usize,
    pub validator: Option<UsernameValidator>,
    pub normalizer: Option<UsernameNormalizer>,
}

impl Default for UsernameOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            min_length: 3,
            max_length: 30,
            validator: None,
            normalizer: None,
        }
    }
}

impl UsernameOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn validator(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn normalizer(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.normalizer = Some(Arc::new(f));
        self
    }

    /// ASCII letters, digits, `_` and `.`
    pub fn is_valid(&self, username: &str) -> bool {
        match &self.validator {
            Some(validator) => validator(username),
            None => username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        }
    }

    /// Lowercase unless a custom normalizer is set
    pub fn normalize(&self, username: &str) -> String {
        match &self.normalizer {
            Some(normalizer) => normalizer(username),
            None => username.to_lowercase(),
        }
    }
}

impl fmt::Debug for UsernameOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernameOptions")
            .field("enabled", &self.enabled)
            .field("min_length", &self.min_length)
            .field("max_length", &self.max_length)
            .field("validator", &self.validator.is_some())
            .field("normalizer", &self.normalizer.is_some())
            .finish()
    }
}

/// Fixed-window rate limiting of sign-in and reset requests
#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    pub enabled: bool,
    pub max_attempts: u32,
    pub window: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Longest accepted lifetime for sessions and tokens
pub const MAX_TTL: Duration = Duration::from_secs(3650 * 24 * 3600);

/// Engine configuration
#[derive(Clone)]
pub struct AuthOptions {
    pub email_and_password_enabled: bool,
    pub min_password_length: usize,
    pub max_password_length: usize,
    pub reset_token_ttl: Duration,
    pub verification_token_ttl: Duration,
    pub session_ttl: Duration,
    /// Sessions older than this are refreshed on resolve
    pub session_update_age: Duration,
    /// Lifetime of sessions created with `remember_me = false`
    pub short_session_ttl: Duration,
    pub require_email_verification: bool,
    pub send_verification_on_sign_up: bool,
    pub username: UsernameOptions,
    /// Public origin used to build links in notifications
    pub base_url: String,
    /// Origins besides `base_url` accepted for callback and redirect URLs
    pub trusted_origins: Vec<String>,
    pub tables: TableNames,
    pub cookie_name: String,
    pub secure_cookies: bool,
    /// Upper bound on each primary store call
    pub store_timeout: Option<Duration>,
    pub rate_limit: RateLimitOptions,
    pub hasher: Arc<dyn PasswordHasher>,
    pub secondary_store: Arc<dyn SecondaryStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            email_and_password_enabled: true,
            min_password_length: 8,
            max_password_length: 128,
            reset_token_ttl: Duration::from_secs(3600),
            verification_token_ttl: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(7 * 24 * 3600),
            session_update_age: Duration::from_secs(24 * 3600),
            short_session_ttl: Duration::from_secs(24 * 3600),
            require_email_verification: false,
            send_verification_on_sign_up: true,
            username: UsernameOptions::default(),
            base_url: "http://localhost:3000".to_string(),
            trusted_origins: Vec::new(),
            tables: TableNames::default(),
            cookie_name: "auth.session_token".to_string(),
            secure_cookies: false,
            store_timeout: None,
            rate_limit: RateLimitOptions::default(),
            hasher: Arc::new(ScryptHasher::new()),
            secondary_store: Arc::new(TtlMemoryStorage::new()),
            notifier: Arc::new(TracingNotifier),
        }
    }
}

impl AuthOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password_length(mut self, min: usize, max: usize) -> Self {
        self.min_password_length = min;
        self.max_password_length = max;
        self
    }

    pub fn reset_token_ttl(mut self, ttl: Duration) -> Self {
        self.reset_token_ttl = ttl;
        self
    }

    pub fn verification_token_ttl(mut self, ttl: Duration) -> Self {
        self.verification_token_ttl = ttl;
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn session_update_age(mut self, age: Duration) -> Self {
        self.session_update_age = age;
        self
    }

    pub fn short_session_ttl(mut self, ttl: Duration) -> Self {
        self.short_session_ttl = ttl;
        self
    }

    pub fn require_email_verification(mut self, required: bool) -> Self {
        self.require_email_verification = required;
        self
    }

    pub fn send_verification_on_sign_up(mut self, send: bool) -> Self {
        self.send_verification_on_sign_up = send;
        self
    }

    pub fn username(mut self, username: UsernameOptions) -> Self {
        self.username = username;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn trusted_origins(mut self, origins: Vec<String>) -> Self {
        self.trusted_origins = origins;
        self
    }

    pub fn tables(mut self, tables: TableNames) -> Self {
        self.tables = tables;
        self
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    pub fn store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitOptions) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn hasher(mut self, hasher: impl PasswordHasher + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    pub fn secondary_store(mut self, store: Arc<dyn SecondaryStore>) -> Self {
        self.secondary_store = store;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Reject settings that can never work; fatal at startup
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.min_password_length == 0 || self.min_password_length > self.max_password_length {
            return Err(AuthError::Configuration(format!(
                "invalid password length bounds {}..={}",
                self.min_password_length, self.max_password_length
            )));
        }
        if self.username.enabled
            && (self.username.min_length == 0
                || self.username.min_length > self.username.max_length)
        {
            return Err(AuthError::Configuration(format!(
                "invalid username length bounds {}..={}",
                self.username.min_length, self.username.max_length
            )));
        }
        for (name, ttl) in [
            ("session_ttl", self.session_ttl),
            ("short_session_ttl", self.short_session_ttl),
            ("reset_token_ttl", self.reset_token_ttl),
            ("verification_token_ttl", self.verification_token_ttl),
        ] {
            if ttl.is_zero() {
                return Err(AuthError::Configuration(format!("{} must be positive", name)));
            }
            if ttl > MAX_TTL {
                return Err(AuthError::Configuration(format!(
                    "{} exceeds {} days",
                    name,
                    MAX_TTL.as_secs() / 86_400
                )));
            }
        }
        if self.session_update_age > MAX_TTL {
            return Err(AuthError::Configuration(
                "session_update_age exceeds the session lifetime bound".to_string(),
            ));
        }
        self.tables.validate().map_err(AuthError::Configuration)?;
        for origin in &self.trusted_origins {
            if origin_of(origin).is_none() {
                return Err(AuthError::Configuration(format!(
                    "trusted origin '{}' is not an http(s) URL",
                    origin
                )));
            }
        }
        if self.cookie_name.is_empty() {
            return Err(AuthError::Configuration("cookie_name is empty".to_string()));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.max_attempts == 0 || self.rate_limit.window.is_zero())
        {
            return Err(AuthError::Configuration(
                "rate limit needs max_attempts and window".to_string(),
            ));
        }
        Ok(())
    }

    /// Callback and redirect targets: a same-site path, or an absolute
    /// http(s) URL on `base_url` or one of `trusted_origins`
    pub fn is_trusted_redirect(&self, url: &str) -> bool {
        if url.starts_with('/') {
            return !url.starts_with("//") && !url.contains('\\');
        }
        let Some(target) = origin_of(url) else {
            return false;
        };
        std::iter::once(&self.base_url)
            .chain(&self.trusted_origins)
            .filter_map(|allowed| origin_of(allowed))
            .any(|allowed| allowed == target)
    }
}

/// `scheme://host[:port]` in lowercase, for http(s) URLs only
fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() || authority.contains(['@', '\\']) {
        return None;
    }
    Some(format!("{}://{}", scheme, authority.to_ascii_lowercase()))
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("email_and_password_enabled", &self.email_and_password_enabled)
            .field("min_password_length", &self.min_password_length)
            .field("max_password_length", &self.max_password_length)
            .field("reset_token_ttl", &self.reset_token_ttl)
            .field("verification_token_ttl", &self.verification_token_ttl)
            .field("session_ttl", &self.session_ttl)
            .field("session_update_age", &self.session_update_age)
            .field("short_session_ttl", &self.short_session_ttl)
            .field("require_email_verification", &self.require_email_verification)
            .field("send_verification_on_sign_up", &self.send_verification_on_sign_up)
            .field("username", &self.username)
            .field("base_url", &self.base_url)
            .field("trusted_origins", &self.trusted_origins)
            .field("tables", &self.tables)
            .field("cookie_name", &self.cookie_name)
            .field("store_timeout", &self.store_timeout)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}
