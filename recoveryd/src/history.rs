//! Append-only JSONL log of state transitions.
//!
//! Each persisted [`RecoveryStateRecord`] is also appended here so `status
//! --history` can show how the controller got to its current phase.

use recovery_common::RecoveryStateRecord;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a JSON line, creating the file and its parent.
    pub fn append(&self, record: &RecoveryStateRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json = serde_json::to_string(record)?;
        writeln!(file, "{json}")?;
        Ok(())
    }

    /// The last `n` records, oldest first. A missing file reads as empty.
    pub fn read_last(&self, n: usize) -> std::io::Result<Vec<RecoveryStateRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = VecDeque::with_capacity(n.min(1024));
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecoveryStateRecord>(&line) {
                Ok(record) => {
                    if n == 0 {
                        continue;
                    }
                    if records.len() >= n {
                        records.pop_front();
                    }
                    records.push_back(record);
                }
                Err(e) => warn!("Skipping invalid history line: {}", e),
            }
        }

        debug!("Read {} history records from {:?}", records.len(), self.path);
        Ok(records.into())
    }
}
