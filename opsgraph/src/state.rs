//! The state store: last-known provider-side state per resource.
//!
//! The store exclusively owns state records. The differ and executor only
//! read or propose against them; only the executor commits, and only after
//! a provider confirmed success.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;

use opsgraph_core::{LogicalName, StateRecord};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// All records in this store's namespace. Empty if none exist yet.
    async fn load(&self) -> Result<BTreeMap<LogicalName, StateRecord>>;

    /// Store `record` under `name`. Atomic per name: afterwards the store
    /// holds either the new record or the prior one, never a partial write.
    async fn commit(&self, name: &LogicalName, record: StateRecord) -> Result<()>;

    /// Remove the record for `name`. Absent name is a no-op.
    async fn delete(&self, name: &LogicalName) -> Result<()>;
}

/// The root of a state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StateFile {
    #[serde(rename = "_type", deserialize_with = "type_is_opsgraph_state")]
    type_: String,
    resources: BTreeMap<LogicalName, StateRecord>,
}

const STATE_FILE_TYPE: &str = "opsgraphState";

fn type_is_opsgraph_state<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == STATE_FILE_TYPE {
        Ok(s)
    } else {
        Err(serde::de::Error::custom(format!(
            "unexpected _type in opsgraph state: expected '{}', got '{}'",
            STATE_FILE_TYPE, s
        )))
    }
}

/// A JSON state file for one namespace.
///
/// Writes go through a temp file and a rename, so a commit either lands
/// whole or not at all. A sibling lock file guards against other processes;
/// the in-process mutex serializes commits from concurrent branches, so two
/// writers to the same name are sequenced and the later write wins.
pub struct FileStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    records: BTreeMap<LogicalName, StateRecord>,
    lock: fd_lock::RwLock<File>,
}

impl FileStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let file: StateFile = serde_json::from_str(&contents)
                    .with_context(|| format!("state file invalid: {}", path.display()))?;
                file.resources
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("could not read state file {}", path.display()))
            }
        };
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(&path))
            .with_context(|| format!("could not open lock file for {}", path.display()))?;
        Ok(FileStateStore {
            path,
            inner: Mutex::new(Inner {
                records,
                lock: fd_lock::RwLock::new(lock_file),
            }),
        })
    }

    fn flush(&self, inner: &mut Inner) -> Result<()> {
        let _guard = inner
            .lock
            .write()
            .with_context(|| format!("could not lock state file {}", self.path.display()))?;
        let file = StateFile {
            type_: STATE_FILE_TYPE.to_owned(),
            resources: inner.records.clone(),
        };
        // Prettified for the humans who end up reading these files.
        let mut contents = serde_json::to_string_pretty(&file)?;
        contents.push('\n');
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("could not write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("could not replace {}", self.path.display()))?;
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<BTreeMap<LogicalName, StateRecord>> {
        Ok(self.inner.lock().await.records.clone())
    }

    async fn commit(&self, name: &LogicalName, record: StateRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = inner.records.insert(name.clone(), record);
        match self.flush(&mut inner) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Keep memory consistent with what is durably stored.
                match previous {
                    Some(p) => inner.records.insert(name.clone(), p),
                    None => inner.records.remove(name),
                };
                Err(e)
            }
        }
    }

    async fn delete(&self, name: &LogicalName) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let previous = match inner.records.remove(name) {
            Some(p) => p,
            None => return Ok(()),
        };
        match self.flush(&mut inner) {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.records.insert(name.clone(), previous);
                Err(e)
            }
        }
    }
}

/// In-memory store, for tests and embedding.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<LogicalName, StateRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<BTreeMap<LogicalName, StateRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn commit(&self, name: &LogicalName, record: StateRecord) -> Result<()> {
        self.records.lock().await.insert(name.clone(), record);
        Ok(())
    }

    async fn delete(&self, name: &LogicalName) -> Result<()> {
        self.records.lock().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsgraph_core::PhysicalId;
    use serde_json::json;

    fn record(type_: &str) -> StateRecord {
        StateRecord {
            type_: type_.to_owned(),
            physical_id: PhysicalId::new("p-1"),
            inputs: [("k".to_owned(), json!("v"))].into_iter().collect(),
            outputs: BTreeMap::new(),
            depends_on: Default::default(),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path().join("state.json")).unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileStateStore::open(&path).unwrap();
            store
                .commit(&LogicalName::new("a"), record("file"))
                .await
                .unwrap();
        }
        let store = FileStateStore::open(&path).unwrap();
        let records = store.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[&LogicalName::new("a")], record("file"));
        // No temp file left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn delete_returns_store_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStateStore::open(&path).unwrap();
        store
            .commit(&LogicalName::new("a"), record("file"))
            .await
            .unwrap();
        store.delete(&LogicalName::new("a")).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());

        let reloaded = FileStateStore::open(&path).unwrap();
        assert!(reloaded.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_absent_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path().join("state.json")).unwrap();
        store.delete(&LogicalName::new("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_type_marker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"_type": "somethingElse", "resources": {}}"#).unwrap();
        assert!(FileStateStore::open(&path).is_err());
    }

    #[tokio::test]
    async fn corrupt_state_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{").unwrap();
        assert!(FileStateStore::open(&path).is_err());
    }

    #[tokio::test]
    async fn later_write_wins_for_same_name() {
        let store = MemoryStateStore::new();
        store
            .commit(&LogicalName::new("a"), record("file"))
            .await
            .unwrap();
        store
            .commit(&LogicalName::new("a"), record("memo"))
            .await
            .unwrap();
        let records = store.load().await.unwrap();
        assert_eq!(records[&LogicalName::new("a")].type_, "memo");
    }
}
