//! Durable storage for admitted defect records.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use defect_core::DefectDocument;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot take writes right now. Retryable.
    #[error("defect store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Document-oriented store for admitted defects, addressed by collection.
///
/// Implementations must tolerate repeated failures: the persistence sink
/// retries rejected documents and the pipeline keeps running either way.
pub trait DefectStore: Send + Sync {
    fn insert(&self, collection: &str, document: &DefectDocument) -> Result<(), StoreError>;

    /// Human-readable locator for log lines.
    fn describe(&self) -> String;
}

/// Filesystem realization of the document store: one JSON-lines file per
/// collection under `<root>/<database>/`.
///
/// File handles are opened lazily and dropped on any write error, so a store
/// that becomes reachable again (remounted disk, recreated directory)
/// recovers on the next insert.
pub struct JsonlStore {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl JsonlStore {
    pub fn open(root: impl Into<PathBuf>, database: &str) -> Self {
        Self {
            dir: root.into().join(database),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.jsonl"))
    }

    fn open_file(&self, collection: &str) -> Result<File, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|err| StoreError::Unavailable {
            reason: format!("cannot create {}: {err}", self.dir.display()),
        })?;
        let path = self.collection_path(collection);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| StoreError::Unavailable {
                reason: format!("cannot open {}: {err}", path.display()),
            })
    }
}

impl DefectStore for JsonlStore {
    fn insert(&self, collection: &str, document: &DefectDocument) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(document).map_err(|err| StoreError::Unavailable {
            reason: format!("serialization failed: {err}"),
        })?;
        line.push(b'\n');

        let mut guard = self.files.lock().map_err(|_| StoreError::Unavailable {
            reason: "store handle poisoned".to_string(),
        })?;
        if !guard.contains_key(collection) {
            let file = self.open_file(collection)?;
            guard.insert(collection.to_string(), file);
        }
        let file = guard
            .get_mut(collection)
            .ok_or_else(|| StoreError::Unavailable {
                reason: "store handle missing".to_string(),
            })?;

        let written = file.write_all(&line).and_then(|_| file.flush());
        if let Err(err) = written {
            // Force a reopen on the next attempt.
            guard.remove(collection);
            return Err(StoreError::Unavailable {
                reason: format!(
                    "write to {} failed: {err}",
                    self.collection_path(collection).display()
                ),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.dir.display())
    }
}
