//! Base table definitions
//!
//! `user`, `session` and `verification` are always registered; the
//! username extension adds a unique `username` column to `user`. Physical
//! table names come from [`TableNames`].

use super::field::Field;
use super::model::Model;
use super::registry::{SchemaBuilder, SchemaError, SchemaRegistry};

pub const USER_TABLE: &str = "user";
pub const SESSION_TABLE: &str = "session";
pub const VERIFICATION_TABLE: &str = "verification";

/// Physical names of the auth tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub user: String,
    pub session: String,
    pub verification: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            user: USER_TABLE.to_string(),
            session: SESSION_TABLE.to_string(),
            verification: VERIFICATION_TABLE.to_string(),
        }
    }
}

impl TableNames {
    pub fn user(mut self, name: impl Into<String>) -> Self {
        self.user = name.into();
        self
    }

    pub fn session(mut self, name: impl Into<String>) -> Self {
        self.session = name.into();
        self
    }

    pub fn verification(mut self, name: impl Into<String>) -> Self {
        self.verification = name.into();
        self
    }

    /// Names must be distinct identifiers of ASCII letters, digits and `_`
    pub fn validate(&self) -> Result<(), String> {
        for name in [&self.user, &self.session, &self.verification] {
            let valid = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(format!("invalid table name '{}'", name));
            }
        }
        if self.user == self.session
            || self.user == self.verification
            || self.session == self.verification
        {
            return Err("table names must be distinct".to_string());
        }
        Ok(())
    }
}

pub fn user_model(tables: &TableNames) -> Model {
    Model::new(&tables.user)
        .field("id", Field::text().primary())
        .field("name", Field::text().not_null())
        .field("email", Field::text().not_null().unique())
        .field(
            "email_verified",
            Field::boolean().not_null().default_value(false),
        )
        .field("image", Field::text())
        .field("password_hash", Field::text())
        .field(
            "created_at",
            Field::timestamptz().not_null().default_expression("NOW()"),
        )
        .field(
            "updated_at",
            Field::timestamptz().not_null().default_expression("NOW()"),
        )
}

pub fn session_model(tables: &TableNames) -> Model {
    Model::new(&tables.session)
        .field("id", Field::text().primary())
        .field(
            "user_id",
            Field::text()
                .not_null()
                .indexed()
                .references(&tables.user, "id"),
        )
        .field("token", Field::text().not_null().unique())
        .field(
            "created_at",
            Field::timestamptz().not_null().default_expression("NOW()"),
        )
        .field("expires_at", Field::timestamptz().not_null())
        .field(
            "updated_at",
            Field::timestamptz().not_null().default_expression("NOW()"),
        )
        .field("ip_address", Field::text())
        .field("user_agent", Field::text())
}

pub fn verification_model(tables: &TableNames) -> Model {
    Model::new(&tables.verification)
        .field("id", Field::text().primary())
        .field("identifier", Field::text().not_null().unique())
        .field("value", Field::text().not_null())
        .field("expires_at", Field::timestamptz().not_null())
        .field(
            "created_at",
            Field::timestamptz().not_null().default_expression("NOW()"),
        )
        .field(
            "updated_at",
            Field::timestamptz().not_null().default_expression("NOW()"),
        )
}

/// Extension registered when username sign-in is enabled
pub fn username_extension(tables: &TableNames) -> Model {
    Model::new(&tables.user).field("username", Field::text().not_null().unique())
}

/// Build the sealed registry for the engine
pub fn auth_schema(
    tables: &TableNames,
    username_enabled: bool,
) -> Result<SchemaRegistry, SchemaError> {
    let mut builder = SchemaBuilder::new();
    builder.register(user_model(tables))?;
    builder.register(session_model(tables))?;
    builder.register(verification_model(tables))?;
    if username_enabled {
        builder.register(username_extension(tables))?;
    }
    builder.resolve()
}
