//! Column descriptors
//!
//! A [`Field`] describes one column of a [`Model`](super::Model): its storage
//! type and the constraints the primary store must enforce for it.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Storage type of a column
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    #[display("TEXT")]
    Text,
    #[display("BOOLEAN")]
    Boolean,
    #[display("BIGINT")]
    Integer,
    #[display("TIMESTAMP")]
    Timestamp,
    #[display("TIMESTAMPTZ")]
    TimestampTz,
}

impl FieldType {
    /// SQL type name used in DDL statements
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Integer => "BIGINT",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::TimestampTz => "TIMESTAMPTZ",
        }
    }

    /// Whether a literal default of the given kind fits this column type
    fn accepts(self, value: &DefaultValue) -> bool {
        matches!(
            (self, value),
            (FieldType::Text, DefaultValue::Text(_))
                | (FieldType::Boolean, DefaultValue::Boolean(_))
                | (FieldType::Integer, DefaultValue::Integer(_))
        )
    }
}

/// Literal default value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    Text(String),
    Boolean(bool),
    Integer(i64),
}

impl DefaultValue {
    /// Render as an SQL literal
    pub fn to_sql(&self) -> String {
        match self {
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DefaultValue::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            DefaultValue::Integer(i) => i.to_string(),
        }
    }
}

impl From<bool> for DefaultValue {
    fn from(value: bool) -> Self {
        DefaultValue::Boolean(value)
    }
}

impl From<i64> for DefaultValue {
    fn from(value: i64) -> Self {
        DefaultValue::Integer(value)
    }
}

impl From<&str> for DefaultValue {
    fn from(value: &str) -> Self {
        DefaultValue::Text(value.to_string())
    }
}

/// Column default: a literal or a store-native expression, never both
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldDefault {
    Literal(DefaultValue),
    /// Store-native expression, e.g. `NOW()`
    Expression(String),
}

impl FieldDefault {
    pub fn to_sql(&self) -> String {
        match self {
            FieldDefault::Literal(value) => value.to_sql(),
            FieldDefault::Expression(expr) => expr.clone(),
        }
    }
}

/// Foreign key target, resolved by name when the registry is sealed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub model: String,
    pub field: String,
}

/// Column descriptor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub field_type: FieldType,
    pub is_primary: bool,
    pub is_unique: bool,
    pub is_not_null: bool,
    pub is_indexed: bool,
    pub default: Option<FieldDefault>,
    pub references: Option<Reference>,
}

impl Field {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            is_primary: false,
            is_unique: false,
            is_not_null: false,
            is_indexed: false,
            default: None,
            references: None,
        }
    }

    pub fn text() -> Self {
        Self::new(FieldType::Text)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn timestamptz() -> Self {
        Self::new(FieldType::TimestampTz)
    }

    /// Mark as primary key; implies NOT NULL and UNIQUE
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.is_not_null = true;
        self.is_unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    /// Request a secondary index on this column
    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    /// Literal default; replaces any default expression
    pub fn default_value(mut self, value: impl Into<DefaultValue>) -> Self {
        self.default = Some(FieldDefault::Literal(value.into()));
        self
    }

    /// Store-native default expression; replaces any literal default
    pub fn default_expression(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(FieldDefault::Expression(expression.into()));
        self
    }

    pub fn references(mut self, model: impl Into<String>, field: impl Into<String>) -> Self {
        self.references = Some(Reference {
            model: model.into(),
            field: field.into(),
        });
        self
    }

    /// A value must be supplied on insert: NOT NULL without a default
    pub fn is_required(&self) -> bool {
        self.is_not_null && self.default.is_none()
    }

    /// Check the literal default against the column type
    pub(crate) fn default_matches_type(&self) -> bool {
        match &self.default {
            Some(FieldDefault::Literal(value)) => self.field_type.accepts(value),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_implies_not_null_and_unique() {
        let field = Field::text().primary();
        assert!(field.is_primary);
        assert!(field.is_not_null);
        assert!(field.is_unique);
    }

    #[test]
    fn test_new_field_is_nullable() {
        let field = Field::text();
        assert!(!field.is_not_null);
        assert!(!field.is_unique);
        assert!(field.default.is_none());
        assert!(field.references.is_none());
    }

    #[test]
    fn test_default_and_expression_are_exclusive() {
        let field = Field::boolean()
            .default_value(false)
            .default_expression("NOW()");
        assert_eq!(field.default, Some(FieldDefault::Expression("NOW()".into())));

        let field = Field::timestamptz()
            .default_expression("NOW()")
            .default_value(false);
        assert_eq!(
            field.default,
            Some(FieldDefault::Literal(DefaultValue::Boolean(false)))
        );
    }

    #[test]
    fn test_default_to_sql() {
        assert_eq!(DefaultValue::Boolean(false).to_sql(), "FALSE");
        assert_eq!(DefaultValue::Integer(42).to_sql(), "42");
        assert_eq!(DefaultValue::from("o'brien").to_sql(), "'o''brien'");
        assert_eq!(
            FieldDefault::Expression("NOW()".into()).to_sql(),
            "NOW()"
        );
    }

    #[test]
    fn test_is_required() {
        assert!(Field::text().not_null().is_required());
        assert!(!Field::boolean().not_null().default_value(false).is_required());
        assert!(!Field::text().is_required());
    }

    #[test]
    fn test_default_matches_type() {
        assert!(Field::boolean().default_value(true).default_matches_type());
        assert!(!Field::text().default_value(true).default_matches_type());
        assert!(Field::timestamptz()
            .default_expression("NOW()")
            .default_matches_type());
    }

    #[test]
    fn test_field_type_display() {
        assert_eq!(FieldType::TimestampTz.to_string(), "TIMESTAMPTZ");
        assert_eq!(FieldType::Text.sql_type(), "TEXT");
    }
}
