//! File-backed vatstore.
//!
//! A `BackingStore` whose whole key/value map lives in one JSON file.
//! Every successful `store` writes the map to a temporary file, fsyncs it
//! and renames it over the live file before returning. The live file is
//! therefore always a complete map that matches what the cache has written
//! back; a crash mid-write leaves at most a stale temporary file.
//! Clones share the same map; a session keeps one handle while the vat's
//! cache owns another.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;
use vat_core::store::BackingStore;
use vat_core::{Effect, EffectLog, VatError};

use crate::error::Result;

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    data: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FileVatStore {
    inner: Rc<RefCell<Inner>>,
    log: EffectLog,
}

impl FileVatStore {
    /// Open the store at `path`, loading whatever was committed there.
    pub fn open(path: &Path, log: EffectLog) -> Result<Self> {
        let data = if path.exists() {
            serde_json::from_str(&fs::read_to_string(path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self::with_data(path, data, log))
    }

    /// Discard any committed content and start empty.
    pub fn reset(path: &Path, log: EffectLog) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(Self::with_data(path, BTreeMap::new(), log))
    }

    fn with_data(path: &Path, data: BTreeMap<String, String>, log: EffectLog) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { path: path.to_path_buf(), data })),
            log,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.borrow().data.get(key).cloned()
    }

    pub fn contents(&self) -> BTreeMap<String, String> {
        self.inner.borrow().data.clone()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.borrow().path.clone()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

fn commit(path: &Path, data: &BTreeMap<String, String>) -> std::io::Result<()> {
    let content = serde_json::to_string(data)?;
    let tmp = temp_path(path);
    let written = write_then_rename(&tmp, path, content.as_bytes());
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    if let Some(parent) = parent {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

impl BackingStore for FileVatStore {
    fn fetch(&mut self, key: &str) -> vat_core::Result<Option<String>> {
        let value = self.inner.borrow().data.get(key).cloned();
        self.log.push(Effect::Fetch { key: key.to_string(), value: value.clone() });
        Ok(value)
    }

    fn store(&mut self, key: &str, value: String) -> vat_core::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let previous = inner.data.insert(key.to_string(), value.clone());
        if let Err(err) = commit(&inner.path, &inner.data) {
            // Roll the map back so memory and disk agree.
            match previous {
                Some(old) => inner.data.insert(key.to_string(), old),
                None => inner.data.remove(key),
            };
            return Err(VatError::Store { key: key.to_string(), detail: err.to_string() });
        }
        debug!(key, bytes = value.len(), "vatstore commit");
        self.log.push(Effect::Store { key: key.to_string(), value });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_are_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vatstore.json");
        let log = EffectLog::new();
        let mut store = FileVatStore::open(&path, log.clone()).unwrap();
        store.store("vom.o+1/1", "{}".into()).unwrap();
        assert_eq!(store.fetch("vom.o+1/1").unwrap(), Some("{}".into()));
        assert_eq!(log.len(), 2);

        let reopened = FileVatStore::open(&path, EffectLog::new()).unwrap();
        assert_eq!(reopened.get("vom.o+1/1"), Some("{}".into()));

        let reset = FileVatStore::reset(&path, EffectLog::new()).unwrap();
        assert!(reset.contents().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn failed_commit_leaves_the_map_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every commit fail.
        let path = dir.path().join("blocked");
        fs::create_dir_all(&path).unwrap();
        let log = EffectLog::new();
        let mut store = FileVatStore::with_data(&path, BTreeMap::new(), log.clone());
        let err = store.store("k", "v".into()).unwrap_err();
        assert!(matches!(err, VatError::Store { .. }));
        assert_eq!(store.get("k"), None);
        assert!(log.is_empty());
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn a_torn_temporary_file_never_reaches_the_live_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vatstore.json");
        let mut store = FileVatStore::open(&path, EffectLog::new()).unwrap();
        store.store("vom.o+1/1", "{}".into()).unwrap();
        assert!(!temp_path(&path).exists());

        // A write interrupted before its rename.
        fs::write(temp_path(&path), "{\"vom.o+1/1\":").unwrap();
        let mut reopened = FileVatStore::open(&path, EffectLog::new()).unwrap();
        assert_eq!(reopened.get("vom.o+1/1"), Some("{}".into()));

        reopened.store("vom.o+1/2", "{}".into()).unwrap();
        assert!(!temp_path(&path).exists());
        let again = FileVatStore::open(&path, EffectLog::new()).unwrap();
        assert_eq!(again.contents().len(), 2);
    }
}
