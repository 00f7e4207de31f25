use serde::{Deserialize, Serialize};

use super::field::Field;

/// A persisted entity: a table name and its ordered columns
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    fields: Vec<(String, Field)>,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a column. A later declaration with the same name replaces the
    /// earlier one in place, keeping names unique and order stable.
    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.insert(name.into(), field);
        self
    }

    pub(crate) fn insert(&mut self, name: String, field: Field) {
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = field,
            None => self.fields.push((name, field)),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, field)| field)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// All primary key columns (a valid model has exactly one)
    pub fn primary_keys(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, field)| field.is_primary)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
