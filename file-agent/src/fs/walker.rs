//! Directory traversal for manifests, backups and listings.

use super::metadata::FileMetadata;
use super::path::relative_slash_path;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// `/`-separated path relative to the walk root
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    /// Returns None for directories, broken symlinks and symlinks to directories.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();

        let size = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                _ => return Ok(None),
            }
        } else if entry.file_type().is_file() {
            entry.metadata()?.len()
        } else {
            return Ok(None);
        };

        Ok(Some(Self {
            relative_path: relative_slash_path(root, &path),
            path,
            size,
        }))
    }
}

/// Walk a directory tree and collect every regular file.
///
/// A missing root is treated as an empty tree.
///
/// # Example
/// ```no_run
/// use file_agent::fs::walker::walk_directory;
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/srv/app")).unwrap();
/// println!("Found {} files", files.len());
/// ```
pub fn walk_directory(root: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, |file| files.push(file.clone()))?;
    Ok(files)
}

/// Walk a directory tree with a callback for each regular file.
/// Symlinks to files are reported; links are never descended into.
pub fn walk_directory_with_callback<F>(root: &Path, mut callback: F) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    if !root.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            callback(&file_info);
        }
    }

    Ok(())
}

/// A direct child of a listed directory
#[derive(Debug, Clone)]
pub struct DirChild {
    pub name: String,
    pub metadata: FileMetadata,
}

/// List the direct children of `dir`: directories first, then files,
/// case-insensitively by name. A missing directory lists as empty.
pub fn list_directory(dir: &Path) -> std::io::Result<Vec<DirChild>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = match FileMetadata::from_path(&entry.path()) {
            Ok(m) => m,
            // Broken symlinks have no target metadata; fall back to the link itself
            Err(_) => FileMetadata::from_symlink(&entry.path())?,
        };
        children.push(DirChild {
            name: entry.file_name().to_string_lossy().to_string(),
            metadata,
        });
    }

    children.sort_by(|a, b| {
        b.metadata
            .is_dir
            .cmp(&a.metadata.is_dir)
            .then(a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(children)
}
