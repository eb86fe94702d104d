//! Append-only JSON-lines stores.
//!
//! Each store is a single file holding one JSON record per line. Records are
//! only ever appended; readers replay the whole file on open and later
//! records for the same key supersede earlier ones.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{RelayError, RelayResult, StoreError};

/// File name of the subscription store inside `DATA_DIR`.
pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.jsonl";

/// File name of the delivery ledger inside `DATA_DIR`.
pub const DELIVERIES_FILE: &str = "deliveries.jsonl";

/// File name of the audit log inside `DATA_DIR`.
pub const AUDIT_FILE: &str = "audit.jsonl";

/// Append-only store of `T` records.
pub struct JsonlStore<T> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonlStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (or create) the store and return every record already in it.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<T>), StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let records = if path.exists() {
            read_records(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        info!(
            path = %path.display(),
            records = records.len(),
            "store_opened"
        );

        Ok((
            Self {
                path,
                file: Mutex::new(file),
                _record: PhantomData,
            },
            records,
        ))
    }

    /// Append one record and flush it to the OS.
    pub fn append(&self, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Run a call that may write to a store on tokio's blocking pool, keeping
/// file I/O off the async worker threads.
pub async fn off_runtime<T, F>(call: F) -> RelayResult<T>
where
    F: FnOnce() -> RelayResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| RelayError::Unavailable(format!("store task failed: {e}")))?
}

/// Read every record from a JSONL file. Blank lines are skipped.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
        name: String,
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rows.jsonl");

        {
            let (store, existing) = JsonlStore::<Row>::open(&path).unwrap();
            assert!(existing.is_empty());
            store.append(&Row { id: 1, name: "a".into() }).unwrap();
            store.append(&Row { id: 2, name: "b".into() }).unwrap();
        }

        let (_store, replayed) = JsonlStore::<Row>::open(&path).unwrap();
        assert_eq!(
            replayed,
            vec![Row { id: 1, name: "a".into() }, Row { id: 2, name: "b".into() }]
        );
    }

    #[tokio::test]
    async fn test_off_runtime_appends_from_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let (store, _) = JsonlStore::<Row>::open(&path).unwrap();
        let store = std::sync::Arc::new(store);

        let writer = std::sync::Arc::clone(&store);
        off_runtime(move || Ok(writer.append(&Row { id: 7, name: "g".into() })?))
            .await
            .unwrap();

        let failed: RelayResult<()> =
            off_runtime(|| Err(RelayError::Validation("nope".to_string()))).await;
        assert!(matches!(failed, Err(RelayError::Validation(_))));

        drop(store);
        let (_store, replayed) = JsonlStore::<Row>::open(&path).unwrap();
        assert_eq!(replayed, vec![Row { id: 7, name: "g".into() }]);
    }

    #[test]
    fn test_corrupt_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        std::fs::write(&path, "{\"id\":1,\"name\":\"a\"}\n\nnot json\n").unwrap();

        let err = JsonlStore::<Row>::open(&path).err().unwrap();
        match err {
            StoreError::Corrupt { line, .. } => assert_eq!(line, 3),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }
}
