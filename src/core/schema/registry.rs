//! Model registration and sealing
//!
//! [`SchemaBuilder`] collects model declarations (base tables plus
//! extensions) and [`SchemaBuilder::resolve`] validates them into an
//! immutable [`SchemaRegistry`]. References between models are checked by
//! name only once every model is registered, so declaration order never
//! matters.

use std::collections::HashMap;

use super::field::Field;
use super::model::Model;

/// Schema declaration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Model '{model}' must declare exactly one primary key, found {found}")]
    PrimaryKeyCount { model: String, found: usize },

    #[error("Conflicting primary key for model '{model}' on field '{field}'")]
    ConflictingPrimaryKey { model: String, field: String },

    #[error("Conflicting type for field '{model}.{field}'")]
    ConflictingType { model: String, field: String },

    #[error("Default value does not match the type of '{model}.{field}'")]
    DefaultTypeMismatch { model: String, field: String },

    #[error("Field '{model}.{field}' references unknown '{target_model}.{target_field}'")]
    UnresolvedReference {
        model: String,
        field: String,
        target_model: String,
        target_field: String,
    },

    #[error("Unknown model '{0}'")]
    UnknownModel(String),
}

/// Mutable registration phase of the schema
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    models: Vec<Model>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, merging its fields into an existing model with the
    /// same name. Redeclaring an existing field is allowed only when the
    /// type and primary-key flag agree.
    pub fn register(&mut self, model: Model) -> Result<&mut Self, SchemaError> {
        for (name, field) in model.fields() {
            if !field.default_matches_type() {
                return Err(SchemaError::DefaultTypeMismatch {
                    model: model.name.clone(),
                    field: name.to_string(),
                });
            }
        }

        let Some(existing) = self.models.iter_mut().find(|m| m.name == model.name) else {
            self.models.push(model);
            return Ok(self);
        };

        for (name, field) in model.fields() {
            if let Some(current) = existing.get(name) {
                check_compatible(&model.name, name, current, field)?;
            } else if field.is_primary && !existing.primary_keys().is_empty() {
                return Err(SchemaError::ConflictingPrimaryKey {
                    model: model.name.clone(),
                    field: name.to_string(),
                });
            }
        }

        for (name, field) in model.fields() {
            existing.insert(name.to_string(), field.clone());
        }

        Ok(self)
    }

    /// Chainable form of [`register`](Self::register)
    pub fn with(mut self, model: Model) -> Result<Self, SchemaError> {
        self.register(model)?;
        Ok(self)
    }

    /// Seal the schema: every model needs exactly one primary key and every
    /// reference must name an existing model and field.
    pub fn resolve(self) -> Result<SchemaRegistry, SchemaError> {
        for model in &self.models {
            let primary = model.primary_keys();
            if primary.len() != 1 {
                return Err(SchemaError::PrimaryKeyCount {
                    model: model.name.clone(),
                    found: primary.len(),
                });
            }
        }

        for model in &self.models {
            for (name, field) in model.fields() {
                let Some(reference) = &field.references else {
                    continue;
                };
                let resolved = self
                    .models
                    .iter()
                    .find(|m| m.name == reference.model)
                    .is_some_and(|target| target.has_field(&reference.field));
                if !resolved {
                    return Err(SchemaError::UnresolvedReference {
                        model: model.name.clone(),
                        field: name.to_string(),
                        target_model: reference.model.clone(),
                        target_field: reference.field.clone(),
                    });
                }
            }
        }

        let index = self
            .models
            .iter()
            .enumerate()
            .map(|(i, model)| (model.name.clone(), i))
            .collect();

        tracing::debug!(models = self.models.len(), "Schema registry sealed");

        Ok(SchemaRegistry {
            models: self.models,
            index,
        })
    }
}

fn check_compatible(
    model: &str,
    name: &str,
    current: &Field,
    incoming: &Field,
) -> Result<(), SchemaError> {
    if current.field_type != incoming.field_type {
        return Err(SchemaError::ConflictingType {
            model: model.to_string(),
            field: name.to_string(),
        });
    }
    if current.is_primary != incoming.is_primary {
        return Err(SchemaError::ConflictingPrimaryKey {
            model: model.to_string(),
            field: name.to_string(),
        });
    }
    Ok(())
}

/// Sealed, read-only set of models
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    models: Vec<Model>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// Models in registration order
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.index.get(name).map(|&i| &self.models[i])
    }

    pub fn has_field(&self, model: &str, field: &str) -> bool {
        self.model(model).is_some_and(|m| m.has_field(field))
    }

    /// Check an insert against NOT NULL constraints. `present` lists the
    /// columns that carry a value; the first required column missing from it
    /// is returned.
    pub fn missing_required<'a>(
        &'a self,
        model: &str,
        present: &[&str],
    ) -> Result<Option<&'a str>, SchemaError> {
        let model = self
            .model(model)
            .ok_or_else(|| SchemaError::UnknownModel(model.to_string()))?;

        Ok(model
            .fields()
            .find(|(name, field)| field.is_required() && !present.contains(name))
            .map(|(name, _)| name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Model {
        Model::new("user")
            .field("id", Field::text().primary())
            .field("email", Field::text().not_null().unique())
    }

    fn session() -> Model {
        Model::new("session")
            .field("id", Field::text().primary())
            .field("user_id", Field::text().not_null().references("user", "id"))
    }

    #[test]
    fn test_resolve_in_any_order() {
        let registry = SchemaBuilder::new()
            .with(session())
            .unwrap()
            .with(user())
            .unwrap()
            .resolve()
            .unwrap();

        let names: Vec<_> = registry.models().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["session", "user"]);
        assert!(registry.model("user").is_some());
        assert!(registry.has_field("session", "user_id"));
    }

    #[test]
    fn test_unresolved_reference() {
        let result = SchemaBuilder::new().with(session()).unwrap().resolve();
        assert!(matches!(
            result,
            Err(SchemaError::UnresolvedReference { ref target_model, .. }) if target_model == "user"
        ));

        let bad_field = Model::new("session")
            .field("id", Field::text().primary())
            .field("user_id", Field::text().references("user", "uuid"));
        let result = SchemaBuilder::new()
            .with(user())
            .unwrap()
            .with(bad_field)
            .unwrap()
            .resolve();
        assert!(matches!(result, Err(SchemaError::UnresolvedReference { .. })));
    }

    #[test]
    fn test_merge_extension_fields() {
        let extension = Model::new("user").field("username", Field::text().unique());
        let registry = SchemaBuilder::new()
            .with(user())
            .unwrap()
            .with(extension)
            .unwrap()
            .resolve()
            .unwrap();

        let model = registry.model("user").unwrap();
        assert_eq!(model.field_names(), vec!["id", "email", "username"]);
    }

    #[test]
    fn test_merge_identical_redeclaration() {
        let result = SchemaBuilder::new().with(user()).unwrap().with(user());
        assert!(result.is_ok());
    }

    #[test]
    fn test_conflicting_type_rejected() {
        let conflicting = Model::new("user").field("email", Field::boolean());
        let result = SchemaBuilder::new().with(user()).unwrap().with(conflicting);
        assert!(matches!(result, Err(SchemaError::ConflictingType { .. })));
    }

    #[test]
    fn test_conflicting_primary_key_rejected() {
        let second_pk = Model::new("user").field("uuid", Field::text().primary());
        let result = SchemaBuilder::new().with(user()).unwrap().with(second_pk);
        assert!(matches!(result, Err(SchemaError::ConflictingPrimaryKey { .. })));

        let demoted = Model::new("user").field("id", Field::text().not_null());
        let result = SchemaBuilder::new().with(user()).unwrap().with(demoted);
        assert!(matches!(result, Err(SchemaError::ConflictingPrimaryKey { .. })));
    }

    #[test]
    fn test_missing_primary_key_rejected_on_resolve() {
        let result = SchemaBuilder::new()
            .with(Model::new("audit").field("message", Field::text()))
            .unwrap()
            .resolve();
        assert_eq!(
            result.unwrap_err(),
            SchemaError::PrimaryKeyCount {
                model: "audit".to_string(),
                found: 0
            }
        );
    }

    #[test]
    fn test_default_type_mismatch_rejected() {
        let bad = Model::new("user")
            .field("id", Field::text().primary())
            .field("verified", Field::boolean().default_value("no"));
        let result = SchemaBuilder::new().with(bad);
        assert!(matches!(result, Err(SchemaError::DefaultTypeMismatch { .. })));
    }

    #[test]
    fn test_missing_required() {
        let registry = SchemaBuilder::new().with(user()).unwrap().resolve().unwrap();

        assert_eq!(
            registry.missing_required("user", &["id"]).unwrap(),
            Some("email")
        );
        assert_eq!(
            registry.missing_required("user", &["id", "email"]).unwrap(),
            None
        );
        assert!(registry.missing_required("nope", &[]).is_err());
    }
}
