//! Web objects and in-memory edit application
//!
//! A `WebObject` is the unit stored in a data sequence: a positive id, a
//! version counter, an optional seal, an optional category reference, and a
//! catalog of named properties. The id is assigned at first insert and is
//! immutable afterwards; administrative re-insert is a delete + insert.
//!
//! # Record JSON form
//!
//! Objects persist as a single JSON object with the data fields inline and
//! reserved meta fields on the side:
//!
//! ```text
//! {"name": "a", "views": 3, "__ver": 2, "__seal": "1c291ca3", "__category": 7}
//! ```
//!
//! `__ver`, `__seal` and `__category` are omitted when unset. An object
//! whose payload is not a mapping keeps it under the reserved `__data` key.

use crate::error::{Error, Result};
use crate::types::Oid;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved meta key: version counter
pub const VER_KEY: &str = "__ver";
/// Reserved meta key: content seal
pub const SEAL_KEY: &str = "__seal";
/// Reserved meta key: category reference
pub const CATEGORY_KEY: &str = "__category";
/// Reserved key holding a non-mapping payload
pub const DATA_KEY: &str = "__data";
/// Annotation key added to `select` results: `{"ring": ..., "block": ...}`
pub const META_KEY: &str = "__meta";

/// One segment of a dotted edit path
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    /// Map key
    Key(String),
    /// Array index
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    if path.is_empty() {
        return Err(Error::Validation("empty edit path".into()));
    }
    Ok(path
        .split('.')
        .map(|seg| {
            if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) {
                PathSegment::Index(seg.parse().unwrap_or(usize::MAX))
            } else {
                PathSegment::Key(seg.to_string())
            }
        })
        .collect())
}

/// One edit operation against an object's data, applied in memory.
///
/// The edit list of an `update` is applied in order; the first failing
/// edit aborts the update and leaves the record at its prior version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Edit {
    /// Set the value at `path`, creating intermediate maps as needed
    Set {
        /// Dotted path into the data catalog
        path: String,
        /// New value (JSON form)
        value: serde_json::Value,
    },
    /// Remove the value at `path`; the path must resolve
    Delete {
        /// Dotted path into the data catalog
        path: String,
    },
    /// Replace the entire data catalog
    Overwrite {
        /// New data catalog (JSON object)
        value: serde_json::Value,
    },
    /// Push a value onto the array at `path`, creating it when absent
    Append {
        /// Dotted path into the data catalog
        path: String,
        /// Appended value (JSON form)
        value: serde_json::Value,
    },
}

/// Schema-driven object stored in a data sequence
#[derive(Debug, Clone, PartialEq)]
pub struct WebObject {
    /// Object id; 0 until the insert policy assigns one
    pub id: Oid,
    /// Version counter; 1 after first insert, bumped by every update
    pub version: u64,
    /// Content seal over the record JSON, hex CRC32
    pub seal: Option<String>,
    /// Category reference used for operator filtering
    pub category: Option<Oid>,
    /// Named properties
    pub data: BTreeMap<String, Value>,
}

impl WebObject {
    /// Create a draft object with no id and no version
    pub fn draft(data: BTreeMap<String, Value>) -> Self {
        WebObject {
            id: 0,
            version: 0,
            seal: None,
            category: None,
            data,
        }
    }

    /// Create a draft object with a category
    pub fn draft_in_category(data: BTreeMap<String, Value>, category: Oid) -> Self {
        WebObject {
            category: Some(category),
            ..WebObject::draft(data)
        }
    }

    /// Serialize to the record JSON form
    pub fn to_record_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.data {
            obj.insert(k.clone(), v.to_json());
        }
        if self.version > 0 {
            obj.insert(VER_KEY.to_string(), serde_json::json!(self.version));
        }
        if let Some(seal) = &self.seal {
            obj.insert(SEAL_KEY.to_string(), serde_json::json!(seal));
        }
        if let Some(cat) = self.category {
            obj.insert(CATEGORY_KEY.to_string(), serde_json::json!(cat));
        }
        serde_json::Value::Object(obj)
    }

    /// Serialize to the record JSON string stored as a record value
    pub fn to_record_string(&self) -> String {
        self.to_record_json().to_string()
    }

    /// Decode from the record JSON form
    pub fn from_record_json(id: Oid, json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| Error::Schema(format!("record [{}] is not a JSON object", id)))?;
        let mut data = BTreeMap::new();
        let mut version = 0;
        let mut seal = None;
        let mut category = None;
        for (k, v) in obj {
            match k.as_str() {
                VER_KEY => {
                    version = v.as_u64().ok_or_else(|| {
                        Error::Schema(format!("record [{}]: {} is not an integer", id, VER_KEY))
                    })?
                }
                SEAL_KEY => seal = v.as_str().map(|s| s.to_string()),
                CATEGORY_KEY => category = v.as_u64(),
                META_KEY => {} // select-time annotation, never persisted state
                _ => {
                    data.insert(k.clone(), Value::from_json(v));
                }
            }
        }
        Ok(WebObject {
            id,
            version,
            seal,
            category,
            data,
        })
    }

    /// Decode from a record value string
    pub fn from_record_str(id: Oid, value: &str) -> Result<Self> {
        let json: serde_json::Value = serde_json::from_str(value)?;
        Self::from_record_json(id, &json)
    }

    /// Read a top-level field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Apply an edit list in order
    pub fn apply_edits(&mut self, edits: &[Edit]) -> Result<()> {
        for edit in edits {
            self.apply_edit(edit)?;
        }
        Ok(())
    }

    fn apply_edit(&mut self, edit: &Edit) -> Result<()> {
        match edit {
            Edit::Overwrite { value } => {
                let obj = value.as_object().ok_or_else(|| {
                    Error::Validation("overwrite value must be a JSON object".into())
                })?;
                self.data = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect();
                Ok(())
            }
            Edit::Set { path, value } => {
                self.set_at_path(path, Value::from_json(value))
            }
            Edit::Delete { path } => self.delete_at_path(path),
            Edit::Append { path, value } => {
                self.append_at_path(path, Value::from_json(value))
            }
        }
    }

    fn set_at_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segments = parse_path(path)?;
        let (first, rest) = segments.split_first().expect("parse_path yields >= 1");
        let key = match first {
            PathSegment::Key(k) => k.clone(),
            PathSegment::Index(_) => {
                return Err(Error::Validation(format!(
                    "path {}: top level is a map, not an array",
                    path
                )))
            }
        };
        if rest.is_empty() {
            self.data.insert(key, value);
            return Ok(());
        }
        // Navigate to the parent, creating intermediate maps as needed
        let mut current = self
            .data
            .entry(key)
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        let (last, middle) = rest.split_last().expect("rest is non-empty");
        for seg in middle {
            current = descend_or_create(current, seg, path)?;
        }
        match (last, current) {
            (PathSegment::Key(k), Value::Map(map)) => {
                map.insert(k.clone(), value);
                Ok(())
            }
            (PathSegment::Index(i), Value::Array(items)) => {
                if *i >= items.len() {
                    return Err(Error::Validation(format!(
                        "path {}: index {} out of bounds (len {})",
                        path,
                        i,
                        items.len()
                    )));
                }
                items[*i] = value;
                Ok(())
            }
            (seg, found) => Err(path_mismatch(path, seg, found)),
        }
    }

    fn delete_at_path(&mut self, path: &str) -> Result<()> {
        let segments = parse_path(path)?;
        let (first, rest) = segments.split_first().expect("parse_path yields >= 1");
        let key = match first {
            PathSegment::Key(k) => k,
            PathSegment::Index(_) => {
                return Err(Error::Validation(format!(
                    "path {}: top level is a map, not an array",
                    path
                )))
            }
        };
        if rest.is_empty() {
            return match self.data.remove(key) {
                Some(_) => Ok(()),
                None => Err(Error::Validation(format!(
                    "path {}: nothing to delete",
                    path
                ))),
            };
        }
        let mut current = self.data.get_mut(key).ok_or_else(|| {
            Error::Validation(format!("path {}: does not resolve", path))
        })?;
        let (last, middle) = rest.split_last().expect("rest is non-empty");
        for seg in middle {
            current = descend(current, seg, path)?;
        }
        match (last, current) {
            (PathSegment::Key(k), Value::Map(map)) => match map.remove(k) {
                Some(_) => Ok(()),
                None => Err(Error::Validation(format!(
                    "path {}: nothing to delete",
                    path
                ))),
            },
            (PathSegment::Index(i), Value::Array(items)) => {
                if *i >= items.len() {
                    return Err(Error::Validation(format!(
                        "path {}: index {} out of bounds (len {})",
                        path,
                        i,
                        items.len()
                    )));
                }
                items.remove(*i);
                Ok(())
            }
            (seg, found) => Err(path_mismatch(path, seg, found)),
        }
    }

    fn append_at_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segments = parse_path(path)?;
        let (first, rest) = segments.split_first().expect("parse_path yields >= 1");
        let key = match first {
            PathSegment::Key(k) => k.clone(),
            PathSegment::Index(_) => {
                return Err(Error::Validation(format!(
                    "path {}: top level is a map, not an array",
                    path
                )))
            }
        };
        let mut current = self
            .data
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()));
        for seg in rest {
            current = descend(current, seg, path)?;
        }
        match current {
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            found => Err(Error::Validation(format!(
                "path {}: expected array, found {}",
                path,
                value_kind(found)
            ))),
        }
    }

    /// Bump the version counter (every committed update)
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Recompute the content seal over the current record JSON.
    ///
    /// The seal field itself is excluded from the sealed bytes.
    pub fn reseal(&mut self) {
        self.seal = None;
        let bytes = self.to_record_string();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes.as_bytes());
        self.seal = Some(format!("{:08x}", hasher.finalize()));
    }

    /// Check the seal against the current contents
    pub fn seal_valid(&self) -> bool {
        let Some(seal) = self.seal.clone() else {
            return false;
        };
        let mut probe = self.clone();
        probe.reseal();
        probe.seal == Some(seal)
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "string",
        Value::Ref(_) => "ref",
        Value::NewRef(_) => "provisional ref",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
    }
}

fn path_mismatch(path: &str, seg: &PathSegment, found: &Value) -> Error {
    let expected = match seg {
        PathSegment::Key(_) => "map",
        PathSegment::Index(_) => "array",
    };
    Error::Validation(format!(
        "path {}: expected {}, found {}",
        path,
        expected,
        value_kind(found)
    ))
}

fn descend<'a>(current: &'a mut Value, seg: &PathSegment, path: &str) -> Result<&'a mut Value> {
    match (seg, current) {
        (PathSegment::Key(k), Value::Map(map)) => map.get_mut(k).ok_or_else(|| {
            Error::Validation(format!("path {}: does not resolve", path))
        }),
        (PathSegment::Index(i), Value::Array(items)) => {
            let len = items.len();
            items.get_mut(*i).ok_or_else(|| {
                Error::Validation(format!(
                    "path {}: index {} out of bounds (len {})",
                    path, i, len
                ))
            })
        }
        (seg, found) => Err(path_mismatch(path, seg, found)),
    }
}

fn descend_or_create<'a>(
    current: &'a mut Value,
    seg: &PathSegment,
    path: &str,
) -> Result<&'a mut Value> {
    match (seg, current) {
        (PathSegment::Key(k), Value::Map(map)) => Ok(map
            .entry(k.clone())
            .or_insert_with(|| Value::Map(BTreeMap::new()))),
        (PathSegment::Index(i), Value::Array(items)) => {
            let len = items.len();
            items.get_mut(*i).ok_or_else(|| {
                Error::Validation(format!(
                    "path {}: index {} out of bounds (len {})",
                    path, i, len
                ))
            })
        }
        (seg, found) => Err(path_mismatch(path, seg, found)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_with(fields: &[(&str, Value)]) -> WebObject {
        WebObject::draft(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_record_json_round_trip() {
        let mut obj = object_with(&[
            ("name", Value::Str("a".into())),
            ("child", Value::Ref(9)),
        ]);
        obj.id = 7;
        obj.version = 2;
        obj.category = Some(3);
        obj.reseal();

        let json = obj.to_record_json();
        assert_eq!(json[VER_KEY], 2);
        assert_eq!(json[CATEGORY_KEY], 3);

        let back = WebObject::from_record_json(7, &json).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_draft_omits_meta_fields() {
        let obj = object_with(&[("n", Value::Int(1))]);
        let json = obj.to_record_json();
        assert!(json.get(VER_KEY).is_none());
        assert!(json.get(SEAL_KEY).is_none());
        assert!(json.get(CATEGORY_KEY).is_none());
    }

    #[test]
    fn test_set_edit_top_level() {
        let mut obj = object_with(&[("v", Value::Int(1))]);
        obj.apply_edits(&[Edit::Set {
            path: "v".into(),
            value: json!(2),
        }])
        .unwrap();
        assert_eq!(obj.get("v"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_set_edit_creates_intermediates() {
        let mut obj = object_with(&[]);
        obj.apply_edits(&[Edit::Set {
            path: "a.b.c".into(),
            value: json!(5),
        }])
        .unwrap();
        match obj.get("a") {
            Some(Value::Map(m)) => match m.get("b") {
                Some(Value::Map(inner)) => assert_eq!(inner.get("c"), Some(&Value::Int(5))),
                other => panic!("expected map at a.b, got {:?}", other),
            },
            other => panic!("expected map at a, got {:?}", other),
        }
    }

    #[test]
    fn test_set_edit_array_index() {
        let mut obj = object_with(&[(
            "items",
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        )]);
        obj.apply_edits(&[Edit::Set {
            path: "items.1".into(),
            value: json!(9),
        }])
        .unwrap();
        assert_eq!(
            obj.get("items"),
            Some(&Value::Array(vec![Value::Int(1), Value::Int(9)]))
        );
    }

    #[test]
    fn test_delete_edit() {
        let mut obj = object_with(&[("x", Value::Int(1)), ("y", Value::Int(2))]);
        obj.apply_edits(&[Edit::Delete { path: "x".into() }]).unwrap();
        assert!(obj.get("x").is_none());
        assert!(obj.get("y").is_some());
    }

    #[test]
    fn test_delete_missing_path_fails() {
        let mut obj = object_with(&[]);
        let err = obj
            .apply_edits(&[Edit::Delete { path: "gone".into() }])
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_append_edit_creates_array() {
        let mut obj = object_with(&[]);
        obj.apply_edits(&[
            Edit::Append {
                path: "tags".into(),
                value: json!("a"),
            },
            Edit::Append {
                path: "tags".into(),
                value: json!("b"),
            },
        ])
        .unwrap();
        assert_eq!(
            obj.get("tags"),
            Some(&Value::Array(vec![
                Value::Str("a".into()),
                Value::Str("b".into())
            ]))
        );
    }

    #[test]
    fn test_overwrite_edit() {
        let mut obj = object_with(&[("old", Value::Int(1))]);
        obj.apply_edits(&[Edit::Overwrite {
            value: json!({"new": true}),
        }])
        .unwrap();
        assert!(obj.get("old").is_none());
        assert_eq!(obj.get("new"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_seal_changes_with_content() {
        let mut obj = object_with(&[("n", Value::Int(1))]);
        obj.version = 1;
        obj.reseal();
        let first = obj.seal.clone().unwrap();
        assert!(obj.seal_valid());

        obj.data.insert("n".into(), Value::Int(2));
        assert!(!obj.seal_valid());
        obj.reseal();
        assert_ne!(obj.seal.clone().unwrap(), first);
        assert!(obj.seal_valid());
    }

    #[test]
    fn test_edit_serde_wire_form() {
        let edit: Edit = serde_json::from_value(json!({
            "op": "set", "path": "v", "value": 2
        }))
        .unwrap();
        assert_eq!(
            edit,
            Edit::Set {
                path: "v".into(),
                value: json!(2)
            }
        );
    }
}
