//! Known reader memory
//!
//! Remembers the last reader a connection succeeded with so the next scan can
//! connect to it without prompting.

use crate::error::KnownReaderError;
use crate::types::ReaderId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Storage for the remembered reader
pub trait KnownReaderStore: Send + Sync {
    /// The remembered reader, if any
    fn load(&self) -> Result<Option<ReaderId>, KnownReaderError>;

    /// Remember `reader` for future sessions
    fn remember(&self, reader: &ReaderId) -> Result<(), KnownReaderError>;

    /// Forget the remembered reader
    fn forget(&self) -> Result<(), KnownReaderError>;
}

/// In-memory store, lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryKnownReaderStore {
    reader: Mutex<Option<ReaderId>>,
}

impl MemoryKnownReaderStore {
    /// Create a store that already knows `reader`
    pub fn with_reader(reader: ReaderId) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
        }
    }
}

impl KnownReaderStore for MemoryKnownReaderStore {
    fn load(&self) -> Result<Option<ReaderId>, KnownReaderError> {
        Ok(self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn remember(&self, reader: &ReaderId) -> Result<(), KnownReaderError> {
        *self.reader.lock().map_err(|_| KnownReaderError::LockPoisoned)? = Some(reader.clone());
        Ok(())
    }

    fn forget(&self) -> Result<(), KnownReaderError> {
        *self.reader.lock().map_err(|_| KnownReaderError::LockPoisoned)? = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KnownReaderFile {
    reader_id: ReaderId,
}

/// Stores the remembered reader in a small TOML file
#[derive(Debug, Clone)]
pub struct FileKnownReaderStore {
    path: PathBuf,
}

impl FileKnownReaderStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_failed(&self, message: impl ToString) -> KnownReaderError {
        KnownReaderError::ReadFailed {
            path: self.path.to_string_lossy().to_string(),
            message: message.to_string(),
        }
    }

    fn write_failed(&self, message: impl ToString) -> KnownReaderError {
        KnownReaderError::WriteFailed {
            path: self.path.to_string_lossy().to_string(),
            message: message.to_string(),
        }
    }
}

impl KnownReaderStore for FileKnownReaderStore {
    fn load(&self) -> Result<Option<ReaderId>, KnownReaderError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.read_failed(e)),
        };

        let file: KnownReaderFile = toml::from_str(&contents).map_err(|e| self.read_failed(e))?;
        Ok(Some(file.reader_id))
    }

    fn remember(&self, reader: &ReaderId) -> Result<(), KnownReaderError> {
        let contents = toml::to_string(&KnownReaderFile {
            reader_id: reader.clone(),
        })
        .map_err(|e| self.write_failed(e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.write_failed(e))?;
        }
        std::fs::write(&self.path, contents).map_err(|e| self.write_failed(e))?;

        tracing::debug!("Remembered reader {} in {:?}", reader, self.path);
        Ok(())
    }

    fn forget(&self) -> Result<(), KnownReaderError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.write_failed(e)),
        }
    }
}
