//! PostgreSQL primary store
//!
//! Queries use runtime-checked `sqlx::query_as` with quoted identifiers,
//! since `user` is a reserved word in PostgreSQL. Table names come from the
//! layout bound after migration. Unique violations are reported by the
//! database and mapped to [`StoreError::UniqueViolation`].

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::core::db::migration::{MigrationStatement, MigrationTarget};
use crate::core::db::models::{NewUser, Session, User, UserUpdate, Verification};
use crate::core::db::store::{PrimaryStore, StoreError};
use crate::core::schema::{SchemaRegistry, TableNames};

const SESSION_COLUMNS: &str =
    "id, user_id, token, created_at, expires_at, updated_at, ip_address, user_agent";

const VERIFICATION_COLUMNS: &str = "id, identifier, value, expires_at, created_at, updated_at";

/// Quoted table names and the user projection for one bound schema
#[derive(Debug)]
struct Layout {
    user: String,
    session: String,
    verification: String,
    username_enabled: bool,
    user_columns: String,
}

impl Layout {
    fn new(tables: &TableNames, username_enabled: bool) -> Self {
        let username = if username_enabled {
            "username"
        } else {
            "NULL::TEXT AS username"
        };
        Self {
            user: quote(&tables.user),
            session: quote(&tables.session),
            verification: quote(&tables.verification),
            username_enabled,
            user_columns: format!(
                "id, name, email, email_verified, image, {}, password_hash, created_at, updated_at",
                username
            ),
        }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Primary store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    layout: Arc<RwLock<Arc<Layout>>>,
}

impl PgStore {
    /// Create a store over the default tables without the `username` column.
    /// [`MigrationTarget::bind_schema`] switches it to a migrated registry.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            layout: Arc::new(RwLock::new(Arc::new(Layout::new(
                &TableNames::default(),
                false,
            )))),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn layout(&self) -> Arc<Layout> {
        self.layout
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MigrationTarget for PgStore {
    async fn existing_columns(&self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        let columns: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT column_name::TEXT
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            Ok(None)
        } else {
            Ok(Some(columns.into_iter().map(|(name,)| name).collect()))
        }
    }

    async fn execute(&self, statement: &MigrationStatement) -> Result<(), StoreError> {
        sqlx::query(statement.sql()).execute(&self.pool).await?;
        Ok(())
    }

    /// The `username` column is only read when the registry declares it
    fn bind_schema(&self, tables: &TableNames, registry: &SchemaRegistry) {
        let layout = Layout::new(tables, registry.has_field(&tables.user, "username"));
        tracing::debug!(
            "Bound primary store to tables {}, {}, {}",
            layout.user,
            layout.session,
            layout.verification
        );
        let mut guard = self
            .layout
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(layout);
    }
}

#[async_trait]
impl PrimaryStore for PgStore {
    async fn insert_user(&self, id: &str, user: &NewUser) -> Result<User, StoreError> {
        let layout = self.layout();
        let sql = if layout.username_enabled {
            format!(
                "INSERT INTO {} (id, name, email, image, password_hash, username)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING {}",
                layout.user, layout.user_columns
            )
        } else {
            format!(
                "INSERT INTO {} (id, name, email, image, password_hash)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {}",
                layout.user, layout.user_columns
            )
        };

        let mut query = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.image)
            .bind(&user.password_hash);
        if layout.username_enabled {
            query = query.bind(&user.username);
        }

        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let layout = self.layout();
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            layout.user_columns, layout.user
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let layout = self.layout();
        let sql = format!(
            "SELECT {} FROM {} WHERE email = $1",
            layout.user_columns, layout.user
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let layout = self.layout();
        if !layout.username_enabled {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE username = $1",
            layout.user_columns, layout.user
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<User, StoreError> {
        let layout = self.layout();
        let sql = format!(
            r#"
            UPDATE {}
            SET name = COALESCE($2, name),
                email = COALESCE($3, email),
                email_verified = COALESCE($4, email_verified),
                image = COALESCE($5, image),
                password_hash = COALESCE($6, password_hash),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            layout.user, layout.user_columns
        );

        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(&update.name)
            .bind(&update.email)
            .bind(update.email_verified)
            .bind(&update.image)
            .bind(&update.password_hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.layout().session,
            SESSION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&session.id)
            .bind(&session.user_id)
            .bind(&session.token)
            .bind(session.created_at)
            .bind(session.expires_at)
            .bind(session.updated_at)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_session_by_id(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            SESSION_COLUMNS,
            self.layout().session
        );
        Ok(sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_session_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE token = $1",
            SESSION_COLUMNS,
            self.layout().session
        );
        Ok(sqlx::query_as::<_, Session>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE user_id = $1 ORDER BY created_at DESC",
            SESSION_COLUMNS,
            self.layout().session
        );
        Ok(sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn refresh_session(
        &self,
        id: &str,
        updated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET updated_at = $2, expires_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            self.layout().session,
            SESSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .bind(updated_at)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.layout().session);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_verification(&self, verification: &Verification) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} ({})
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.layout().verification,
            VERIFICATION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&verification.id)
            .bind(&verification.identifier)
            .bind(&verification.value)
            .bind(verification.expires_at)
            .bind(verification.created_at)
            .bind(verification.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn find_verification(
        &self,
        identifier: &str,
    ) -> Result<Option<Verification>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE identifier = $1",
            VERIFICATION_COLUMNS,
            self.layout().verification
        );
        Ok(sqlx::query_as::<_, Verification>(&sql)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn delete_verification(&self, id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.layout().verification);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }
}
