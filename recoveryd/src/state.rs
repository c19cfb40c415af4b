//! Durable recovery state.
//!
//! The state file always holds one complete JSON [`RecoveryStateRecord`]:
//! writes go to a sibling temp file that is renamed over the target, so a
//! reader never observes a partial record. Observers inside the process get
//! copies through a watch channel.

use crate::history::HistoryLog;
use recovery_common::RecoveryStateRecord;
use recovery_common::util::write_atomic;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is not a valid record: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize state record: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct StateStore {
    path: PathBuf,
    history: Option<HistoryLog>,
    current: watch::Sender<RecoveryStateRecord>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, history: Option<HistoryLog>) -> Self {
        let (current, _) = watch::channel(RecoveryStateRecord::initial());
        Self {
            path: path.into(),
            history,
            current,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the last persisted record.
    #[cfg(test)]
    pub fn snapshot(&self) -> RecoveryStateRecord {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoveryStateRecord> {
        self.current.subscribe()
    }

    /// Atomically replace the state file, then publish the record.
    ///
    /// History append failures are logged and ignored; the state file is
    /// the source of truth.
    pub fn persist(&self, record: RecoveryStateRecord) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.path, &json).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(phase = %record.phase, attempt = record.attempt_count, "Persisted recovery state");

        if let Some(history) = &self.history {
            if let Err(e) = history.append(&record) {
                warn!("Failed to append to history {:?}: {}", history.path(), e);
            }
        }

        self.current.send_replace(record);
        Ok(())
    }

    /// Read the record at `path`. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<RecoveryStateRecord>, StateError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StateError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }
}
