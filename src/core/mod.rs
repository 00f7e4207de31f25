//! Core domain models and business logic for authentication

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod options;
pub mod password;
pub mod schema;
pub mod storage;

pub use auth::{AuthEngine, AuthResult};
pub use error::AuthError;
pub use options::{AuthOptions, RateLimitOptions, UsernameOptions};
