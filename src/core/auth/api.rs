//! Auth API endpoints
//!
//! Mounts the engine operations under `/api/auth`:
//! - POST /sign-up/email
//! - POST /sign-in/email
//! - POST /sign-in/username
//! - POST /sign-out
//! - GET /get-session
//! - POST /change-email
//! - POST /request-password-reset
//! - POST /reset-password
//! - POST /change-password
//! - GET /verify-email?token=

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;

use crate::core::auth::credential::{
    ChangeEmail, ChangePassword, RequestPasswordReset, ResetPassword, SignInEmail,
    SignInUsername, SignUpEmail, VerifyEmail,
};
use crate::core::auth::engine::AuthEngine;
use crate::core::auth::result::{AuthResult, ErrorBody};

/// Auth API state containing the engine
#[derive(Clone)]
pub struct AuthApiState {
    pub engine: AuthEngine,
}

impl<T: Serialize> IntoResponse for AuthResult<T> {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().extend(self.headers);
        response
    }
}

/// Malformed request bodies get the same error shape as engine failures
fn bad_request(rejection: JsonRejection) -> Response {
    tracing::debug!("Rejected request body: {}", rejection);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody::new(rejection.body_text(), "VALIDATION_ERROR")),
    )
        .into_response()
}

/// Create the auth API router
pub fn auth_api_router(state: AuthApiState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .route("/api/auth/sign-up/email", post(sign_up_email_handler))
        .route("/api/auth/sign-in/email", post(sign_in_email_handler))
        .route("/api/auth/sign-in/username", post(sign_in_username_handler))
        .route("/api/auth/sign-out", post(sign_out_handler))
        .route("/api/auth/get-session", get(get_session_handler))
        .route("/api/auth/change-email", post(change_email_handler))
        .route(
            "/api/auth/request-password-reset",
            post(request_password_reset_handler),
        )
        .route("/api/auth/reset-password", post(reset_password_handler))
        .route("/api/auth/change-password", post(change_password_handler))
        .route("/api/auth/verify-email", get(verify_email_handler))
        .with_state(state)
}

/// Health check
pub async fn health_handler() -> &'static str {
    "OK"
}

/// POST /api/auth/sign-up/email
async fn sign_up_email_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Result<Json<SignUpEmail>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state.engine.sign_up_email(input, &headers).await.into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// POST /api/auth/sign-in/email
async fn sign_in_email_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Result<Json<SignInEmail>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state.engine.sign_in_email(input, &headers).await.into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// POST /api/auth/sign-in/username
async fn sign_in_username_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Result<Json<SignInUsername>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state
            .engine
            .sign_in_username(input, &headers)
            .await
            .into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// POST /api/auth/sign-out
async fn sign_out_handler(State(state): State<Arc<AuthApiState>>, headers: HeaderMap) -> Response {
    state.engine.sign_out(&headers).await.into_response()
}

/// GET /api/auth/get-session
async fn get_session_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
) -> Response {
    state.engine.get_session(&headers).await.into_response()
}

/// POST /api/auth/change-email
async fn change_email_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Result<Json<ChangeEmail>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state.engine.change_email(input, &headers).await.into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// POST /api/auth/request-password-reset
async fn request_password_reset_handler(
    State(state): State<Arc<AuthApiState>>,
    body: Result<Json<RequestPasswordReset>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state.engine.request_password_reset(input).await.into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// POST /api/auth/reset-password
async fn reset_password_handler(
    State(state): State<Arc<AuthApiState>>,
    body: Result<Json<ResetPassword>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state.engine.reset_password(input).await.into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// POST /api/auth/change-password
async fn change_password_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Result<Json<ChangePassword>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(input)) => state
            .engine
            .change_password(input, &headers)
            .await
            .into_response(),
        Err(rejection) => bad_request(rejection),
    }
}

/// GET /api/auth/verify-email?token=...&callback_url=...
async fn verify_email_handler(
    State(state): State<Arc<AuthApiState>>,
    Query(query): Query<VerifyEmail>,
) -> Response {
    state.engine.verify_email(query).await.into_response()
}
