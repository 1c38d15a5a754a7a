use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::store::{load_document, read_document, timestamp_format, write_document};

/// One distilled long-term memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: usize,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    pub content: String,
    /// Turns folded into this entry; zero for entries produced by compression.
    #[serde(default, alias = "source_count")]
    pub source_count: usize,
}

/// The long-term state file: consolidation cursor, memory set and affinity score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongTermDocument {
    #[serde(default, alias = "processed_count")]
    pub processed_count: usize,
    #[serde(default)]
    pub memories: Vec<MemoryEntry>,
    #[serde(default)]
    pub favorability: i64,
}

/// Shared backing file for the affinity tracker and the memory consolidator.
///
/// Each writer patches only its own fields under `write_lock`, so affinity updates and
/// consolidation runs can interleave without overwriting each other.
pub struct LongTermStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LongTermStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> LongTermDocument {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        load_document(&self.path, "long-term state")
    }

    /// Read the current document, apply `patch`, and write it back.
    /// Nothing is written when the file cannot be read or parsed.
    pub fn update<F>(&self, patch: F) -> Result<()>
    where
        F: FnOnce(&mut LongTermDocument),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document: LongTermDocument = read_document(&self.path)?.unwrap_or_default();
        patch(&mut document);
        write_document(&self.path, &document)
    }
}
