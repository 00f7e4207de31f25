//! Declarative schema for the auth tables
//!
//! Models are declared as typed field sets, merged with extensions and
//! sealed into a [`SchemaRegistry`] that drives migration and constraint
//! checks.

mod field;
mod model;
mod registry;
pub mod tables;

pub use field::{DefaultValue, Field, FieldDefault, FieldType, Reference};
pub use model::Model;
pub use registry::{SchemaBuilder, SchemaError, SchemaRegistry};
pub use tables::{SESSION_TABLE, TableNames, USER_TABLE, VERIFICATION_TABLE, auth_schema};
