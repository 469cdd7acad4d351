//! JSON-lines index store
//!
//! Development-time backend for derived sequences. One line per record:
//!
//! ```text
//! [[1,7,1,3],"{\"name\":\"x\"}"]
//! [[1,9]]
//! ```
//!
//! The first element is the binary key as an integer array; the second is
//! the value string and is omitted for value-less records. A trailing
//! newline terminates the file.

use crate::memory::{collect_range, max_data_id};
use crate::traits::{ScanIter, ScanOpts, Store};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use torus_core::{Error, Result};

/// JSON-lines backed store for a derived sequence
#[derive(Debug)]
pub struct JsonIndexStore {
    path: PathBuf,
    data: RwLock<BTreeMap<Vec<u8>, String>>,
}

impl JsonIndexStore {
    /// Store backed by the JSON-lines file at `path`; the file may not
    /// exist yet
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        JsonIndexStore {
            path: path.as_ref().to_path_buf(),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    fn load(&self) -> Result<BTreeMap<Vec<u8>, String>> {
        let mut records = BTreeMap::new();
        if !self.path.exists() {
            return Ok(records);
        }
        let text = std::fs::read_to_string(&self.path)?;
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: serde_json::Value = serde_json::from_str(line)?;
            let entry = parsed.as_array().ok_or_else(|| {
                Error::Store(format!(
                    "{}:{}: line is not a JSON array",
                    self.path.display(),
                    lineno + 1
                ))
            })?;
            let key_json = entry.first().and_then(|v| v.as_array()).ok_or_else(|| {
                Error::Store(format!(
                    "{}:{}: missing key byte array",
                    self.path.display(),
                    lineno + 1
                ))
            })?;
            let key: Vec<u8> = key_json
                .iter()
                .map(|v| {
                    v.as_u64()
                        .filter(|&b| b <= u8::MAX as u64)
                        .map(|b| b as u8)
                        .ok_or_else(|| {
                            Error::Store(format!(
                                "{}:{}: key element is not a byte",
                                self.path.display(),
                                lineno + 1
                            ))
                        })
                })
                .collect::<Result<_>>()?;
            let value = match entry.get(1) {
                Some(v) => v
                    .as_str()
                    .ok_or_else(|| {
                        Error::Store(format!(
                            "{}:{}: value is not a string",
                            self.path.display(),
                            lineno + 1
                        ))
                    })?
                    .to_string(),
                None => String::new(),
            };
            records.insert(key, value);
        }
        Ok(records)
    }

    fn render(data: &BTreeMap<Vec<u8>, String>) -> String {
        let mut out = String::new();
        for (key, value) in data {
            let key_json: Vec<serde_json::Value> =
                key.iter().map(|&b| serde_json::json!(b)).collect();
            let line = if value.is_empty() {
                serde_json::json!([key_json])
            } else {
                serde_json::json!([key_json, value])
            };
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}

impl Store for JsonIndexStore {
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
            Self::render(&data)
        };
        let tmp = self.path.with_extension("jl.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
