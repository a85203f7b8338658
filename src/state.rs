//! Exactly-once state for grouped aggregation.
//!
//! Stage-1 group-by executors keep their durable aggregate per key in a
//! [`StateStore`]. Every write carries the batch id as its version and is
//! idempotent: `put(key, value, version)` is applied only when `version` is
//! newer than the stored one, so replaying a commit for a batch that already
//! landed changes nothing.
//!
//! Stores are created per group-by node by a [`StateFactory`].

use crate::batch::BatchId;
use crate::config::TaskContext;
use crate::value::{GroupKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Error type for state store operations.
#[derive(Error, Debug)]
pub enum StateError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(String),
  /// Storage backend failure.
  #[error("storage error: {0}")]
  Storage(String),
}

/// A stored value and the batch that wrote it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
  /// Aggregate value.
  pub value: Value,
  /// Batch whose commit produced it.
  pub version: BatchId,
}

/// Keyed, versioned store backing one group-by node.
pub trait StateStore: Send {
  /// Current value and version for `key`.
  fn get(&self, key: &GroupKey) -> Result<Option<Versioned>, StateError>;

  /// Writes `value` at `version` if `version` is newer than the stored one.
  ///
  /// Returns whether the write was applied.
  fn put(&mut self, key: GroupKey, value: Value, version: BatchId) -> Result<bool, StateError>;

  /// Makes applied writes durable. Called once per committed batch.
  fn sync(&mut self) -> Result<(), StateError> {
    Ok(())
  }

  /// Drops applied writes that were never synced. Called on rollback.
  fn revert(&mut self) -> Result<(), StateError> {
    Ok(())
  }
}

/// Creates the store for a group-by node.
pub trait StateFactory: Send + Sync {
  /// Opens the store named `name` for the task described by `context`.
  fn make_store(
    &self,
    name: &str,
    context: &TaskContext,
  ) -> Result<Box<dyn StateStore>, StateError>;
}

fn apply(
  map: &mut HashMap<GroupKey, Versioned>,
  key: GroupKey,
  value: Value,
  version: BatchId,
) -> bool {
  match map.get(&key) {
    Some(current) if current.version >= version => false,
    _ => {
      map.insert(key, Versioned { value, version });
      true
    }
  }
}

type SharedMap = Arc<Mutex<HashMap<GroupKey, Versioned>>>;

fn lock(map: &SharedMap) -> Result<std::sync::MutexGuard<'_, HashMap<GroupKey, Versioned>>, StateError> {
  map.lock()
    .map_err(|_| StateError::Storage("state map lock poisoned".to_string()))
}

/// In-memory store whose contents stay readable through its factory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStateFactory {
  map: SharedMap,
}

impl InMemoryStateFactory {
  /// Creates an empty factory.
  pub fn new() -> Self {
    Self::default()
  }

  /// Copy of the current contents.
  pub fn snapshot(&self) -> HashMap<GroupKey, Versioned> {
    self.map.lock().map(|m| m.clone()).unwrap_or_default()
  }

  /// Current value for `key`, if any.
  pub fn value(&self, key: &GroupKey) -> Option<Value> {
    self.map
      .lock()
      .ok()
      .and_then(|m| m.get(key).map(|v| v.value.clone()))
  }
}

impl StateFactory for InMemoryStateFactory {
  fn make_store(
    &self,
    _name: &str,
    _context: &TaskContext,
  ) -> Result<Box<dyn StateStore>, StateError> {
    Ok(Box::new(InMemoryStateStore {
      map: Arc::clone(&self.map),
    }))
  }
}

/// Handle onto an [`InMemoryStateFactory`]'s map.
#[derive(Debug)]
pub struct InMemoryStateStore {
  map: SharedMap,
}

impl StateStore for InMemoryStateStore {
  fn get(&self, key: &GroupKey) -> Result<Option<Versioned>, StateError> {
    Ok(lock(&self.map)?.get(key).cloned())
  }

  fn put(&mut self, key: GroupKey, value: Value, version: BatchId) -> Result<bool, StateError> {
    let mut map = lock(&self.map)?;
    Ok(apply(&mut map, key, value, version))
  }
}

/// File-backed stores under a base directory.
///
/// Each store is one JSON document `<base>/<task>-<instance>-<name>.json`,
/// rewritten on every [`StateStore::sync`].
#[derive(Clone, Debug)]
pub struct FileStateFactory {
  base_path: PathBuf,
}

impl FileStateFactory {
  /// Creates a factory writing under `base_path`.
  pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  fn store_path(&self, name: &str, context: &TaskContext) -> PathBuf {
    let raw = format!("{}-{}-{}", context.task_name, context.instance, name);
    let safe = raw.replace(|c: char| !c.is_alphanumeric() && c != '_' && c != '-', "_");
    self.base_path.join(format!("{}.json", safe))
  }
}

impl StateFactory for FileStateFactory {
  fn make_store(
    &self,
    name: &str,
    context: &TaskContext,
  ) -> Result<Box<dyn StateStore>, StateError> {
    std::fs::create_dir_all(&self.base_path)?;
    Ok(Box::new(FileStateStore::open(self.store_path(name, context))?))
  }
}

/// A single JSON-file store.
#[derive(Debug)]
pub struct FileStateStore {
  path: PathBuf,
  map: HashMap<GroupKey, Versioned>,
  dirty: bool,
}

impl FileStateStore {
  /// Opens `path`, loading existing contents if the file exists.
  pub fn open(path: PathBuf) -> Result<Self, StateError> {
    let map = load(&path)?;
    Ok(Self {
      path,
      map,
      dirty: false,
    })
  }
}

fn load(path: &Path) -> Result<HashMap<GroupKey, Versioned>, StateError> {
  if !path.exists() {
    return Ok(HashMap::new());
  }
  let json = std::fs::read_to_string(path)?;
  let entries: Vec<(GroupKey, Versioned)> =
    serde_json::from_str(&json).map_err(|e| StateError::Serialization(e.to_string()))?;
  Ok(entries.into_iter().collect())
}

impl StateStore for FileStateStore {
  fn get(&self, key: &GroupKey) -> Result<Option<Versioned>, StateError> {
    Ok(self.map.get(key).cloned())
  }

  fn put(&mut self, key: GroupKey, value: Value, version: BatchId) -> Result<bool, StateError> {
    let applied = apply(&mut self.map, key, value, version);
    self.dirty |= applied;
    Ok(applied)
  }

  fn sync(&mut self) -> Result<(), StateError> {
    if !self.dirty {
      return Ok(());
    }
    let entries: Vec<(&GroupKey, &Versioned)> = self.map.iter().collect();
    let json = serde_json::to_string(&entries)
      .map_err(|e| StateError::Serialization(e.to_string()))?;
    let tmp = self.path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &self.path)?;
    self.dirty = false;
    Ok(())
  }

  fn revert(&mut self) -> Result<(), StateError> {
    if self.dirty {
      self.map = load(&self.path)?;
      self.dirty = false;
      debug!(path = %self.path.display(), "reverted unsynced writes");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn key(s: &str) -> GroupKey {
    GroupKey(vec![Value::from(s)])
  }

  #[test]
  fn put_is_idempotent_per_version() {
    let factory = InMemoryStateFactory::new();
    let mut store = factory.make_store("counts", &TaskContext::new("t")).unwrap();
    assert!(store.put(key("a"), Value::Int(1), BatchId::new(1)).unwrap());
    assert!(!store.put(key("a"), Value::Int(99), BatchId::new(1)).unwrap());
    assert!(!store.put(key("a"), Value::Int(99), BatchId::new(0)).unwrap());
    assert!(store.put(key("a"), Value::Int(2), BatchId::new(2)).unwrap());
    assert_eq!(factory.value(&key("a")), Some(Value::Int(2)));
  }

  #[test]
  fn file_store_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let factory = FileStateFactory::new(tmp.path());
    let ctx = TaskContext::new("agg");
    {
      let mut store = factory.make_store("counts", &ctx).unwrap();
      store.put(key("a"), Value::Int(3), BatchId::new(4)).unwrap();
      store.sync().unwrap();
    }
    let store = factory.make_store("counts", &ctx).unwrap();
    assert_eq!(
      store.get(&key("a")).unwrap(),
      Some(Versioned {
        value: Value::Int(3),
        version: BatchId::new(4),
      })
    );
  }

  #[test]
  fn unsynced_writes_are_not_persisted() {
    let tmp = TempDir::new().unwrap();
    let factory = FileStateFactory::new(tmp.path());
    let ctx = TaskContext::new("agg");
    {
      let mut store = factory.make_store("counts", &ctx).unwrap();
      store.put(key("a"), Value::Int(3), BatchId::new(1)).unwrap();
    }
    let store = factory.make_store("counts", &ctx).unwrap();
    assert_eq!(store.get(&key("a")).unwrap(), None);
  }

  #[test]
  fn revert_drops_only_unsynced_writes() {
    let tmp = TempDir::new().unwrap();
    let factory = FileStateFactory::new(tmp.path());
    let ctx = TaskContext::new("agg");
    let mut store = factory.make_store("counts", &ctx).unwrap();
    store.put(key("a"), Value::Int(1), BatchId::new(1)).unwrap();
    store.sync().unwrap();
    store.put(key("a"), Value::Int(5), BatchId::new(2)).unwrap();
    store.put(key("b"), Value::Int(2), BatchId::new(2)).unwrap();

    store.revert().unwrap();
    assert_eq!(store.get(&key("a")).unwrap().map(|v| v.value), Some(Value::Int(1)));
    assert_eq!(store.get(&key("b")).unwrap(), None);
    // batch 2 can be applied again after the revert
    assert!(store.put(key("a"), Value::Int(5), BatchId::new(2)).unwrap());
  }
}
