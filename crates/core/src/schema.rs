//! Record schemas
//!
//! A `Schema` declares the typed fields of a category of objects. The
//! storage core consumes schemas for three things only: validating objects
//! at write time, extracting the fields an operator's key/payload names,
//! and finding *strong* references for cascade deletion. Fields not
//! declared in the schema are allowed and pass validation untouched.

use crate::error::{Error, Result};
use crate::types::Oid;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// 64-bit signed integer
    Int,
    /// 64-bit float; integers widen
    Float,
    /// Boolean
    Bool,
    /// UTF-8 string
    Str,
    /// Object reference; `strong` references cascade on removal
    Ref {
        /// Deleting the last strong path to a target deletes the target
        strong: bool,
    },
    /// Any value; never type-checked
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Int, Value::Int(_)) => true,
            (FieldType::Float, Value::Int(_) | Value::Float(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Str, Value::Str(_)) => true,
            (FieldType::Ref { .. }, Value::Ref(_) | Value::NewRef(_)) => true,
            (FieldType::Any, _) => true,
            _ => false,
        }
    }
}

/// Typed field catalog for one category of objects
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Field name -> declared type
    pub fields: BTreeMap<String, FieldType>,
}

impl Schema {
    /// Empty schema: everything validates
    pub fn new() -> Self {
        Schema::default()
    }

    /// Builder-style field declaration
    pub fn with_field(mut self, name: &str, ftype: FieldType) -> Self {
        self.fields.insert(name.to_string(), ftype);
        self
    }

    /// Declared type of `field`, if any
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields.get(field).copied()
    }

    /// Whether `field` is declared as a strong reference
    pub fn is_strong_ref(&self, field: &str) -> bool {
        matches!(self.field_type(field), Some(FieldType::Ref { strong: true }))
    }

    /// Type-check `data` against the declared fields.
    ///
    /// Declared fields may hold a single value of the declared type, or an
    /// array of such values (plural fields). Undeclared fields pass.
    pub fn validate(&self, data: &BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in data {
            let Some(ftype) = self.field_type(name) else {
                continue;
            };
            let ok = match value {
                Value::Array(items) => items.iter().all(|v| ftype.accepts(v)),
                single => ftype.accepts(single),
            };
            if !ok {
                return Err(Error::Validation(format!(
                    "field {}: value does not match declared type {:?}",
                    name, ftype
                )));
            }
        }
        Ok(())
    }

    /// Collect `(path, id)` for every reference stored under a field
    /// declared as a *strong* reference.
    ///
    /// Plural strong fields contribute one entry per element; the path of
    /// an element is the field name itself.
    pub fn strong_refs(&self, data: &BTreeMap<String, Value>) -> Vec<(String, Oid)> {
        let mut out = Vec::new();
        for (name, ftype) in &self.fields {
            if !matches!(ftype, FieldType::Ref { strong: true }) {
                continue;
            }
            if let Some(value) = data.get(name) {
                for item in value.as_list() {
                    if let Some(id) = item.as_ref_id() {
                        out.push((name.clone(), id));
                    }
                }
            }
        }
        out
    }
}

/// Strip the plural marker from an operator field name.
///
/// A trailing `$` denotes a plural (array-valued) field; `category$`
/// reads the `category` property and yields one extraction per element.
pub fn singular_name(field: &str) -> (&str, bool) {
    match field.strip_suffix('$') {
        Some(base) => (base, true),
        None => (field, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new()
            .with_field("name", FieldType::Str)
            .with_field("views", FieldType::Int)
            .with_field("child", FieldType::Ref { strong: true })
            .with_field("link", FieldType::Ref { strong: false })
    }

    #[test]
    fn test_validate_accepts_matching_fields() {
        let schema = sample_schema();
        let data = BTreeMap::from([
            ("name".to_string(), Value::Str("a".into())),
            ("views".to_string(), Value::Int(3)),
            ("child".to_string(), Value::Ref(9)),
            ("undeclared".to_string(), Value::Float(1.5)),
        ]);
        assert!(schema.validate(&data).is_ok());
    }

    #[test]
    fn test_validate_rejects_type_mismatch() {
        let schema = sample_schema();
        let data = BTreeMap::from([("views".to_string(), Value::Str("three".into()))]);
        assert!(matches!(
            schema.validate(&data),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_validate_accepts_plural_fields() {
        let schema = sample_schema();
        let data = BTreeMap::from([(
            "views".to_string(),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        )]);
        assert!(schema.validate(&data).is_ok());
    }

    #[test]
    fn test_validate_accepts_provisional_refs() {
        let schema = sample_schema();
        let data = BTreeMap::from([("child".to_string(), Value::NewRef(0))]);
        assert!(schema.validate(&data).is_ok());
    }

    #[test]
    fn test_strong_refs_collects_only_strong() {
        let schema = sample_schema();
        let data = BTreeMap::from([
            ("child".to_string(), Value::Ref(5)),
            ("link".to_string(), Value::Ref(6)),
        ]);
        assert_eq!(schema.strong_refs(&data), vec![("child".to_string(), 5)]);
    }

    #[test]
    fn test_strong_refs_plural() {
        let schema = Schema::new().with_field("parts", FieldType::Ref { strong: true });
        let data = BTreeMap::from([(
            "parts".to_string(),
            Value::Array(vec![Value::Ref(1), Value::Ref(2)]),
        )]);
        assert_eq!(
            schema.strong_refs(&data),
            vec![("parts".to_string(), 1), ("parts".to_string(), 2)]
        );
    }

    #[test]
    fn test_singular_name() {
        assert_eq!(singular_name("tags$"), ("tags", true));
        assert_eq!(singular_name("name"), ("name", false));
    }
}
