//! Authentication module
//!
//! This module provides the credential and session flows:
//! - Sign-up and sign-in by email or username
//! - Server-side sessions cached in a secondary store
//! - Email verification, email change and password reset tokens
//! - The [`AuthEngine`] facade and its result envelope
//! - REST API endpoints (feature `server`)

#[cfg(feature = "server")]
pub mod api;
pub mod credential;
pub mod engine;
pub mod notify;
pub mod rate_limit;
pub mod result;
pub mod session;

#[cfg(feature = "server")]
pub use api::{AuthApiState, auth_api_router, health_handler};
pub use credential::{
    ChangeEmail, ChangePassword, CredentialService, RequestPasswordReset, ResetPassword,
    SignInEmail, SignInUsername, SignUpEmail, SignUpOutcome, VerifyEmail,
};
pub use engine::{
    AuthEngine, SessionResponse, SignInResponse, SignUpResponse, StatusResponse,
    SuccessResponse, VerifyEmailResponse,
};
pub use notify::{Notifier, NotifyError, TracingNotifier};
pub use rate_limit::RateLimiter;
pub use result::{AuthResult, Body, ErrorBody, extract_token};
pub use session::SessionManager;
