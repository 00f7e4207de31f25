//! Notification hooks
//!
//! The engine calls a [`Notifier`] to deliver verification and reset links
//! and to report completed sign-outs.
//! Delivery failures are logged and never fail the operation that triggered
//! them; see [`dispatch`].

use std::future::Future;

use async_trait::async_trait;

use crate::core::db::models::{Session, User};

/// Notification error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Outbound messages triggered by credential flows
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_verification_email(
        &self,
        user: &User,
        url: &str,
        token: &str,
    ) -> Result<(), NotifyError>;

    async fn send_reset_password(
        &self,
        user: &User,
        url: &str,
        token: &str,
    ) -> Result<(), NotifyError>;

    async fn send_change_email_verification(
        &self,
        user: &User,
        new_email: &str,
        url: &str,
        token: &str,
    ) -> Result<(), NotifyError>;

    async fn on_password_change(&self, _user: &User) -> Result<(), NotifyError> {
        Ok(())
    }

    /// Called after every successful sign-out. `session` is the revoked
    /// session, or `None` when the request carried no live session.
    async fn on_sign_out(&self, _session: Option<&Session>) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Development notifier: logs that a message would be sent. Links are not
/// logged because they embed the token.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_verification_email(
        &self,
        user: &User,
        _url: &str,
        _token: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!("Verification email for user {} to {}", user.id, user.email);
        Ok(())
    }

    async fn send_reset_password(
        &self,
        user: &User,
        _url: &str,
        _token: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!("Password reset email for user {} to {}", user.id, user.email);
        Ok(())
    }

    async fn send_change_email_verification(
        &self,
        user: &User,
        new_email: &str,
        _url: &str,
        _token: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            "Email change confirmation for user {} to {}",
            user.id,
            new_email
        );
        Ok(())
    }

    async fn on_password_change(&self, user: &User) -> Result<(), NotifyError> {
        tracing::info!("Password changed for user {}", user.id);
        Ok(())
    }

    async fn on_sign_out(&self, session: Option<&Session>) -> Result<(), NotifyError> {
        match session {
            Some(session) => tracing::info!("User {} signed out", session.user_id),
            None => tracing::debug!("Sign-out without a live session"),
        }
        Ok(())
    }
}

/// Await a notification, logging instead of propagating failure
pub(crate) async fn dispatch<F>(kind: &'static str, user_id: &str, fut: F)
where
    F: Future<Output = Result<(), NotifyError>>,
{
    if let Err(e) = fut.await {
        tracing::warn!("Failed to send {} notification for user {}: {}", kind, user_id, e);
    }
}
