//! In-process primary store
//!
//! [`MemoryStore`] keeps every table behind a single `tokio::sync::RwLock`,
//! so uniqueness checks and inserts happen under one write guard and are
//! atomic with respect to concurrent callers. It also records the physical
//! columns created by migrations, which lets the migration runner be tested
//! without a database. Table names follow the ones bound by
//! [`MigrationTarget::bind_schema`] and default to the built-in names.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock as SyncRwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::db::migration::{MigrationStatement, MigrationTarget};
use crate::core::db::models::{NewUser, Session, User, UserUpdate, Verification};
use crate::core::db::store::{PrimaryStore, StoreError};
use crate::core::schema::{SchemaRegistry, TableNames};

#[derive(Default)]
struct Tables {
    columns: HashMap<String, Vec<String>>,
    users: HashMap<String, User>,
    sessions: HashMap<String, Session>,
    verifications: HashMap<String, Verification>,
}

impl Tables {
    fn require_table(&self, table: &str) -> Result<(), StoreError> {
        if self.columns.contains_key(table) {
            Ok(())
        } else {
            Err(StoreError::Database(format!(
                "relation \"{}\" does not exist",
                table
            )))
        }
    }

    fn email_taken(&self, email: &str, except_id: Option<&str>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.id.as_str()) != except_id)
    }
}

/// Primary store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    names: SyncRwLock<TableNames>,
    latency_ms: AtomicU64,
    fail_on: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every data call by `latency`; used to exercise deadlines
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make the next DDL statement against `table` fail once
    pub fn fail_next_execute_on(&self, table: &str) {
        if let Ok(mut guard) = self.fail_on.lock() {
            *guard = Some(table.to_string());
        }
    }

    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }

    pub async fn session_count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    fn names(&self) -> TableNames {
        self.names
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn take_failure(&self, table: &str) -> bool {
        match self.fail_on.lock() {
            Ok(mut guard) if guard.as_deref() == Some(table) => {
                *guard = None;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl MigrationTarget for MemoryStore {
    async fn existing_columns(&self, table: &str) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self.tables.read().await.columns.get(table).cloned())
    }

    async fn execute(&self, statement: &MigrationStatement) -> Result<(), StoreError> {
        if self.take_failure(statement.table()) {
            return Err(StoreError::Database(format!(
                "injected failure: {}",
                statement.sql()
            )));
        }

        let mut tables = self.tables.write().await;
        match statement {
            MigrationStatement::CreateTable { table, columns, .. } => {
                tables
                    .columns
                    .entry(table.clone())
                    .or_insert_with(|| columns.clone());
            }
            MigrationStatement::AddColumn { table, column, .. } => {
                let existing = tables.columns.get_mut(table).ok_or_else(|| {
                    StoreError::Database(format!("relation \"{}\" does not exist", table))
                })?;
                if !existing.contains(column) {
                    existing.push(column.clone());
                }
            }
            MigrationStatement::CreateIndex { table, .. } => tables.require_table(table)?,
            MigrationStatement::AddForeignKey {
                table,
                column,
                references,
                ..
            } => {
                tables.require_table(references)?;
                let existing = tables.columns.get(table).ok_or_else(|| {
                    StoreError::Database(format!("relation \"{}\" does not exist", table))
                })?;
                if !existing.contains(column) {
                    return Err(StoreError::Database(format!(
                        "column \"{}\" referenced in foreign key constraint does not exist",
                        column
                    )));
                }
            }
        }
        Ok(())
    }

    fn bind_schema(&self, tables: &TableNames, _registry: &SchemaRegistry) {
        let mut names = self
            .names
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *names = tables.clone();
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn insert_user(&self, id: &str, user: &NewUser) -> Result<User, StoreError> {
        self.delay().await;
        let mut tables = self.tables.write().await;
        tables.require_table(&self.names().user)?;

        if tables.email_taken(&user.email, None) {
            return Err(StoreError::UniqueViolation {
                column: "email".to_string(),
            });
        }
        if let Some(username) = &user.username
            && tables
                .users
                .values()
                .any(|u| u.username.as_deref() == Some(username.as_str()))
        {
            return Err(StoreError::UniqueViolation {
                column: "username".to_string(),
            });
        }
        if tables.users.contains_key(id) {
            return Err(StoreError::UniqueViolation {
                column: "id".to_string(),
            });
        }

        let row = user.clone().into_user(id.to_string(), Utc::now());
        tables.users.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        self.delay().await;
        Ok(self.tables.read().await.users.get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.delay().await;
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        self.delay().await;
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.username.as_deref() == Some(username))
            .cloned())
    }

    async fn update_user(&self, id: &str, update: &UserUpdate) -> Result<User, StoreError> {
        self.delay().await;
        let mut tables = self.tables.write().await;

        if let Some(email) = &update.email
            && tables.email_taken(email, Some(id))
        {
            return Err(StoreError::UniqueViolation {
                column: "email".to_string(),
            });
        }

        let user = tables.users.get_mut(id).ok_or(StoreError::NotFound)?;
        update.apply(user, Utc::now());
        Ok(user.clone())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.delay().await;
        let mut tables = self.tables.write().await;
        tables.require_table(&self.names().session)?;

        if !tables.users.contains_key(&session.user_id) {
            return Err(StoreError::Database(format!(
                "foreign key violation: user '{}' does not exist",
                session.user_id
            )));
        }
        if tables.sessions.values().any(|s| s.token == session.token) {
            return Err(StoreError::UniqueViolation {
                column: "token".to_string(),
            });
        }

        tables.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_session_by_id(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.delay().await;
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn find_session_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        self.delay().await;
        let tables = self.tables.read().await;
        Ok(tables.sessions.values().find(|s| s.token == token).cloned())
    }

    async fn find_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        self.delay().await;
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn refresh_session(
        &self,
        id: &str,
        updated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        self.delay().await;
        let mut tables = self.tables.write().await;
        Ok(tables.sessions.get_mut(id).map(|session| {
            session.updated_at = updated_at;
            session.expires_at = expires_at;
            session.clone()
        }))
    }

    async fn delete_session(&self, id: &str) -> Result<bool, StoreError> {
        self.delay().await;
        Ok(self.tables.write().await.sessions.remove(id).is_some())
    }

    async fn insert_verification(&self, verification: &Verification) -> Result<(), StoreError> {
        self.delay().await;
        let mut tables = self.tables.write().await;
        tables.require_table(&self.names().verification)?;

        if tables
            .verifications
            .values()
            .any(|v| v.identifier == verification.identifier)
        {
            return Err(StoreError::UniqueViolation {
                column: "identifier".to_string(),
            });
        }

        tables
            .verifications
            .insert(verification.id.clone(), verification.clone());
        Ok(())
    }

    async fn find_verification(
        &self,
        identifier: &str,
    ) -> Result<Option<Verification>, StoreError> {
        self.delay().await;
        let tables = self.tables.read().await;
        Ok(tables
            .verifications
            .values()
            .find(|v| v.identifier == identifier)
            .cloned())
    }

    async fn delete_verification(&self, id: &str) -> Result<bool, StoreError> {
        self.delay().await;
        Ok(self.tables.write().await.verifications.remove(id).is_some())
    }
}
