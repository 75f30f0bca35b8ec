//! Atomic JSONL result files.
//!
//! Records are written to a sibling temp file, flushed and synced, then
//! renamed over the destination. Readers see either the previous file or the
//! complete new one, never a prefix.

use crate::models::{EvalError, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Writes a full batch of records to `path` as JSON lines in one step.
#[derive(Debug, Clone)]
pub struct ResultsWriter {
    path: PathBuf,
}

impl ResultsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "results".to_string());
        self.path
            .with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()))
    }

    /// Serialize every record, one per line, and publish the file.
    ///
    /// Returns the number of lines written. On error nothing is left at
    /// `path` that was not there before.
    pub fn write_all<T: Serialize>(&self, records: &[T]) -> Result<usize> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| EvalError::io("creating output directory", e))?;
        }

        let temp_path = self.temp_path();
        if let Err(e) = Self::write_temp(&temp_path, records) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(EvalError::io("renaming results file", e));
        }

        info!(path = %self.path.display(), records = records.len(), "Results written");
        Ok(records.len())
    }

    fn write_temp<T: Serialize>(temp_path: &Path, records: &[T]) -> Result<()> {
        let file =
            File::create(temp_path).map_err(|e| EvalError::io("creating temp results file", e))?;
        let mut writer = BufWriter::new(file);

        for record in records {
            serde_json::to_writer(&mut writer, record)
                .map_err(|e| EvalError::Internal(format!("Serializing record: {e}")))?;
            writer
                .write_all(b"\n")
                .map_err(|e| EvalError::io("writing temp results file", e))?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| EvalError::io("flushing temp results file", e.into_error()))?;
        file.sync_all()
            .map_err(|e| EvalError::io("syncing temp results file", e))?;

        debug!(path = %temp_path.display(), "Temp results file synced");
        Ok(())
    }
}
