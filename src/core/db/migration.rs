//! Additive schema migration
//!
//! [`MigrationRunner`] compares the sealed [`SchemaRegistry`] with the
//! physical schema reported by a [`MigrationTarget`] and issues only
//! `CREATE TABLE IF NOT EXISTS`, `ADD COLUMN IF NOT EXISTS` and
//! `CREATE INDEX IF NOT EXISTS` statements, followed by foreign keys guarded
//! by a catalog lookup. Every table exists before any constraint refers to
//! it, so registration order never matters. Nothing is ever dropped or
//! altered, so running it on every start is safe. A failed statement stops
//! the run; re-running picks up where it left off.

use async_trait::async_trait;

use crate::core::db::store::StoreError;
use crate::core::schema::{Field, Model, SchemaRegistry, TableNames};

/// One idempotent DDL statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatement {
    CreateTable {
        table: String,
        columns: Vec<String>,
        sql: String,
    },
    AddColumn { table: String, column: String, sql: String },
    CreateIndex { table: String, column: String, sql: String },
    AddForeignKey {
        table: String,
        column: String,
        references: String,
        sql: String,
    },
}

impl MigrationStatement {
    pub fn sql(&self) -> &str {
        match self {
            MigrationStatement::CreateTable { sql, .. }
            | MigrationStatement::AddColumn { sql, .. }
            | MigrationStatement::CreateIndex { sql, .. }
            | MigrationStatement::AddForeignKey { sql, .. } => sql,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            MigrationStatement::CreateTable { table, .. }
            | MigrationStatement::AddColumn { table, .. }
            | MigrationStatement::CreateIndex { table, .. }
            | MigrationStatement::AddForeignKey { table, .. } => table,
        }
    }
}

/// Physical schema the runner can inspect and extend
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Column names of `table`, or `None` if the table does not exist
    async fn existing_columns(&self, table: &str) -> Result<Option<Vec<String>>, StoreError>;

    async fn execute(&self, statement: &MigrationStatement) -> Result<(), StoreError>;

    /// Point data queries at the tables of a migrated registry
    fn bind_schema(&self, tables: &TableNames, registry: &SchemaRegistry);
}

/// Migration failure with the statement that caused it
#[derive(Debug, thiserror::Error)]
#[error("Migration failed on table '{table}': {source}")]
pub struct MigrationError {
    pub table: String,
    pub sql: String,
    #[source]
    pub source: StoreError,
}

/// Statements applied by a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<MigrationStatement>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Converges the primary store towards the declared models
pub struct MigrationRunner<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Compute the statements needed for `target`: tables and columns in
    /// registration order, then indexes, then foreign keys
    pub async fn plan(
        &self,
        target: &dyn MigrationTarget,
    ) -> Result<Vec<MigrationStatement>, MigrationError> {
        let mut statements = Vec::new();
        let mut indexes = Vec::new();
        let mut foreign_keys = Vec::new();

        for model in self.registry.models() {
            let existing = target
                .existing_columns(&model.name)
                .await
                .map_err(|source| MigrationError {
                    table: model.name.clone(),
                    sql: String::new(),
                    source,
                })?;

            match existing {
                None => statements.push(create_table(model)),
                Some(columns) => {
                    for (name, field) in model.fields() {
                        if !columns.iter().any(|c| c == name) {
                            statements.push(add_column(model, name, field));
                        }
                    }
                }
            }

            // Both are idempotent, so they are planned on every run
            indexes.extend(create_indexes(model));
            foreign_keys.extend(add_foreign_keys(model));
        }

        statements.extend(indexes);
        statements.extend(foreign_keys);
        Ok(statements)
    }

    /// Plan and apply. Stops at the first failing statement.
    pub async fn run(&self, target: &dyn MigrationTarget) -> Result<MigrationReport, MigrationError> {
        let statements = self.plan(target).await?;
        let mut report = MigrationReport::default();

        for statement in statements {
            target
                .execute(&statement)
                .await
                .map_err(|source| MigrationError {
                    table: statement.table().to_string(),
                    sql: statement.sql().to_string(),
                    source,
                })?;

            match &statement {
                MigrationStatement::CreateIndex { .. }
                | MigrationStatement::AddForeignKey { .. } => {
                    tracing::debug!("Ensured constraint: {}", statement.sql());
                }
                _ => {
                    tracing::info!("Applied migration: {}", statement.sql());
                    report.applied.push(statement);
                }
            }
        }

        if report.is_noop() {
            tracing::info!("Database schema is up to date");
        } else {
            tracing::info!(
                "Database migrations completed: {} statement(s) applied",
                report.applied.len()
            );
        }

        Ok(report)
    }
}

/// Identifiers are always quoted: `user` is reserved in PostgreSQL
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quoted SQL string literal
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn column_definition(name: &str, field: &Field, allow_not_null: bool) -> String {
    let mut def = format!("{} {}", quote(name), field.field_type.sql_type());

    if field.is_primary {
        def.push_str(" PRIMARY KEY");
    } else if field.is_unique {
        def.push_str(" UNIQUE");
    }
    if field.is_not_null && allow_not_null {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = &field.default {
        def.push_str(" DEFAULT ");
        def.push_str(&default.to_sql());
    }
    def
}

fn create_table(model: &Model) -> MigrationStatement {
    let columns: Vec<String> = model
        .fields()
        .map(|(name, field)| column_definition(name, field, true))
        .collect();

    MigrationStatement::CreateTable {
        table: model.name.clone(),
        columns: model.field_names().into_iter().map(String::from).collect(),
        sql: format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&model.name),
            columns.join(", ")
        ),
    }
}

fn add_column(model: &Model, name: &str, field: &Field) -> MigrationStatement {
    // Existing rows would violate NOT NULL without a default
    let allow_not_null = !field.is_required();
    if !allow_not_null {
        tracing::warn!(
            "Adding '{}.{}' as nullable: NOT NULL requires a default on existing tables",
            model.name,
            name
        );
    }

    MigrationStatement::AddColumn {
        table: model.name.clone(),
        column: name.to_string(),
        sql: format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
            quote(&model.name),
            column_definition(name, field, allow_not_null)
        ),
    }
}

fn create_indexes(model: &Model) -> Vec<MigrationStatement> {
    model
        .fields()
        .filter(|(_, field)| field.is_indexed && !field.is_unique)
        .map(|(name, _)| MigrationStatement::CreateIndex {
            table: model.name.clone(),
            column: name.to_string(),
            sql: format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&format!("{}_{}_idx", model.name, name)),
                quote(&model.name),
                quote(name)
            ),
        })
        .collect()
}

/// PostgreSQL has no `ADD CONSTRAINT IF NOT EXISTS`; the constraint is added
/// only when `pg_constraint` has no entry with its name on the table.
fn add_foreign_keys(model: &Model) -> Vec<MigrationStatement> {
    model
        .fields()
        .filter_map(|(name, field)| field.references.as_ref().map(|r| (name, r)))
        .map(|(name, reference)| {
            let constraint = format!("{}_{}_fkey", model.name, name);
            let sql = format!(
                "DO $$ BEGIN \
                 IF NOT EXISTS (SELECT 1 FROM pg_constraint \
                 WHERE conname = {} AND conrelid = {}::regclass) THEN \
                 ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) \
                 REFERENCES {} ({}) ON DELETE CASCADE; \
                 END IF; END $$",
                literal(&constraint),
                literal(&quote(&model.name)),
                quote(&model.name),
                quote(&constraint),
                quote(name),
                quote(&reference.model),
                quote(&reference.field)
            );
            MigrationStatement::AddForeignKey {
                table: model.name.clone(),
                column: name.to_string(),
                references: reference.model.clone(),
                sql,
            }
        })
        .collect()
}
