//! YAML-file data store
//!
//! Development-time backend for data sequences. The file is a YAML
//! sequence of mappings, each carrying `__id` plus the object's fields
//! inline (a non-mapping payload sits under `__data`):
//!
//! ```yaml
//! - __id: 1
//!   name: root
//! - __id: 1000
//!   name: leaf
//!   __ver: 2
//! ```
//!
//! Records are unsorted on disk and sorted in memory at `open`; `flush`
//! rewrites the whole file in ascending id order through a temp-file
//! rename, so repeated flushes are idempotent and never leave a partial
//! file behind.

use crate::memory::{collect_range, max_data_id};
use crate::traits::{ScanIter, ScanOpts, Store};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use torus_core::{decode_id, encode_id, Error, Result};

/// YAML-backed store for a data sequence
#[derive(Debug)]
pub struct YamlDataStore {
    path: PathBuf,
    data: RwLock<BTreeMap<Vec<u8>, String>>,
}

const ID_FIELD: &str = "__id";

impl YamlDataStore {
    /// Store backed by the YAML file at `path`; the file may not exist yet
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        YamlDataStore {
            path: path.as_ref().to_path_buf(),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<Vec<u8>, String>> {
        let mut records = BTreeMap::new();
        if !self.path.exists() {
            return Ok(records);
        }
        let text = std::fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(records);
        }
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&text).map_err(|e| Error::Yaml(e.to_string()))?;
        let entries = parsed.as_sequence().ok_or_else(|| {
            Error::Yaml(format!("{}: top level is not a sequence", self.path.display()))
        })?;
        for (i, entry) in entries.iter().enumerate() {
            let mapping = entry.as_mapping().ok_or_else(|| {
                Error::Yaml(format!("{}: entry {} is not a mapping", self.path.display(), i))
            })?;
            let mut id = None;
            let mut fields = serde_json::Map::new();
            for (k, v) in mapping {
                let name = k.as_str().ok_or_else(|| {
                    Error::Yaml(format!(
                        "{}: entry {} has a non-string field name",
                        self.path.display(),
                        i
                    ))
                })?;
                if name == ID_FIELD {
                    id = v.as_u64();
                    continue;
                }
                let json = serde_json::to_value(v)?;
                fields.insert(name.to_string(), json);
            }
            let id = id.ok_or_else(|| {
                Error::Yaml(format!(
                    "{}: entry {} is missing {}",
                    self.path.display(),
                    i,
                    ID_FIELD
                ))
            })?;
            let value = serde_json::Value::Object(fields).to_string();
            records.insert(encode_id(id), value);
        }
        Ok(records)
    }

    fn render(&self, data: &BTreeMap<Vec<u8>, String>) -> Result<String> {
        let mut entries = Vec::with_capacity(data.len());
        for (key, value) in data {
            let id = decode_id(key)?;
            let fields: serde_json::Value = serde_json::from_str(value)?;
            let fields = fields.as_object().ok_or_else(|| {
                Error::Store(format!("record [{}] value is not a JSON object", id))
            })?;
            let mut mapping = serde_yaml::Mapping::new();
            mapping.insert(
                serde_yaml::Value::String(ID_FIELD.to_string()),
                serde_yaml::Value::Number(id.into()),
            );
            for (k, v) in fields {
                let yaml =
                    serde_yaml::to_value(v).map_err(|e| Error::Yaml(e.to_string()))?;
                mapping.insert(serde_yaml::Value::String(k.clone()), yaml);
            }
            entries.push(serde_yaml::Value::Mapping(mapping));
        }
        serde_yaml::to_string(&entries).map_err(|e| Error::Yaml(e.to_string()))
    }
}

impl Store for YamlDataStore {
    fn open(&self) -> Result<u64> {
        let records = self.load()?;
        let mut data = self.data.write();
        *data = records;
        Ok(max_data_id(&data))
    }

    fn get(&self, key: &[u8]) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &str) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_string());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn scan(&self, opts: &ScanOpts) -> Result<ScanIter> {
        let pairs = collect_range(&self.data.read(), opts);
        Ok(Box::new(pairs.into_iter().map(Ok)))
    }

    fn erase(&self) -> Result<()> {
        self.data.write().clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let text = {
            let data = self.data.read();
            self.render(&data)?
        };
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
