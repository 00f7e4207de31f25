//! authengine - pluggable authentication engine
//!
//! Email/password and username sign-in, server-side sessions with a
//! cache-aside secondary store, single-use verification tokens and an
//! additive schema migrator, behind a transport-agnostic [`AuthEngine`]
//! facade. The `server` feature adds an axum adapter and binary.
//!
//! [`AuthEngine`]: crate::core::auth::AuthEngine

pub mod core;
