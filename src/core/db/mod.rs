//! Primary store layer
//!
//! Entity models, the [`PrimaryStore`] abstraction with its PostgreSQL and
//! in-memory implementations, and the additive migration runner.

pub mod memory;
pub mod migration;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use migration::{
    MigrationError, MigrationReport, MigrationRunner, MigrationStatement, MigrationTarget,
};
pub use models::*;
pub use pool::{DbConfig, DbError, create_pool, health_check};
pub use postgres::PgStore;
pub use store::{Deadline, PrimaryStore, StoreError};

pub use sqlx::PgPool;
