//! File metadata reported by directory listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Last modified time
    pub modified: DateTime<Utc>,

    pub is_dir: bool,
}

impl FileMetadata {
    /// Metadata of `path`, following symlinks.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self::build(&fs::metadata(path)?))
    }

    /// Metadata of the link itself (used for dangling links).
    pub fn from_symlink(path: &Path) -> std::io::Result<Self> {
        Ok(Self::build(&fs::symlink_metadata(path)?))
    }

    fn build(metadata: &fs::Metadata) -> Self {
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

        Self {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            is_dir: metadata.is_dir(),
        }
    }
}
