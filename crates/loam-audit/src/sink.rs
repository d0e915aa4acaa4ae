// DURABLE AUDIT SINK
// JSONL persistence for the audit chain; storage engine unconstrained,
// only the append-only contract matters

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use crate::chain::AuditEntry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audit sink I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("audit sink record {line} is not valid JSON: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Appends each audit entry as one JSON line. Replayed at bootstrap to
/// rebuild (and re-verify) the in-memory chain.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: File,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<JsonlAuditSink, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Io { path: path.clone(), source })?;
        Ok(JsonlAuditSink { path, file })
    }

    /// Persist one entry. Flushes so a crash loses at most the entry
    /// being written, never an acknowledged one.
    pub fn persist(&mut self, entry: &AuditEntry) -> Result<(), SinkError> {
        let line = serde_json::to_string(entry).expect("audit entries always serialize");
        writeln!(self.file, "{line}")
            .and_then(|_| self.file.flush())
            .map_err(|source| SinkError::Io { path: self.path.clone(), source })
    }

    /// Load every persisted entry in order. A malformed line is an
    /// error, not a skip: a half-written tail would hide tampering.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, SinkError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|source| SinkError::Io { path: path.clone(), source })?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| SinkError::Io { path: path.clone(), source })?;
            if line.trim().is_empty() {
                warn!("audit sink: blank line {} in {}", line_no, path.display());
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)
                .map_err(|source| SinkError::Malformed { line: line_no, source })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
