//! Append-only CSV history files
//!
//! The history files are the sole source of truth across restarts. Every
//! write is either a full-header write (file empty) or a headerless
//! append; a partial header never appears mid-file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::HistoryConfig;
use crate::error::Result;

/// One append-only CSV file guarded by its own lock
pub struct HistoryFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of rows, writing the header iff the file is empty
    pub async fn append<T: Serialize>(&self, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let write_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);

        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        debug!(path = %self.path.display(), rows = rows.len(), "history appended");
        Ok(())
    }

    /// Load every row; a missing file yields an empty list
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let _guard = self.lock.lock().await;

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::Reader::from_reader(file);
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            rows.push(record?);
        }
        Ok(rows)
    }

    /// Remove the file; absent files are not an error
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The daemon's two history files
#[derive(Clone)]
pub struct Histories {
    pub http_test: Arc<HistoryFile>,
    pub cf_scan: Arc<HistoryFile>,
}

impl Histories {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            http_test: Arc::new(HistoryFile::new(&config.http_test_file)),
            cf_scan: Arc::new(HistoryFile::new(&config.cf_scan_file)),
        }
    }
}
