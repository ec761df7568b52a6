use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;

/// Default file the consumer appends retained messages to.
pub const DEFAULT_MESSAGES_FILE: &str = "messages.txt";

/// Best-effort storage of the retained message window.
pub trait Persister: Send + Sync {
    fn persist(&self, snapshot: &[Vec<u8>]) -> Result<(), PersistenceError>;
}

/// Appends every entry of each snapshot, one per line, as the raw payload
/// bytes. The file is opened per call so it can be rotated or removed while the consumer runs.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl Persister for FileSink {
    fn persist(&self, snapshot: &[Vec<u8>]) -> Result<(), PersistenceError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.error(e))?;
        let mut writer = BufWriter::new(file);
        for message in snapshot {
            writer.write_all(message).map_err(|e| self.error(e))?;
            writer.write_all(b"\n").map_err(|e| self.error(e))?;
        }
        writer.flush().map_err(|e| self.error(e))
    }
}
