//! Pre-mutation backups.
//!
//! Every mutating operation opens a snapshot of the project library before
//! touching it and closes it afterwards by diffing the library against the
//! snapshot. A backup that saw no change is dropped; one that did is kept
//! under `<backups>/<project>/<backup_id>/` with:
//!
//! - `files/`: pre-mutation copies of every modified or removed file
//! - `snapshot.json`: the captured manifest
//! - `summary.json`: the [`ChangeSummary`]
//!
//! The store is append-only; pruning old backups is someone else's job.

use crate::fs::path::{resolve, validate_name};
use crate::fs::walker::walk_directory;
use crate::sync::manifest::{build_manifest, Manifest};
use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const FILES_DIR: &str = "files";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SUMMARY_FILE: &str = "summary.json";

/// What a mutation changed, by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub backup_id: String,
    pub project_id: String,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of changed paths
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// An open snapshot, held until its diff runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub backup_id: String,
    pub project_id: String,
    pub root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub captured_manifest: Manifest,
}

pub struct BackupCoordinator {
    backups_dir: PathBuf,
    copy_files: bool,
    open: Mutex<HashMap<String, BackupSnapshot>>,
}

impl BackupCoordinator {
    pub fn new(backups_dir: PathBuf, copy_files: bool) -> Self {
        Self {
            backups_dir,
            copy_files,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn open_map(&self) -> MutexGuard<'_, HashMap<String, BackupSnapshot>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backup_dir(&self, project_id: &str, backup_id: &str) -> PathBuf {
        self.backups_dir.join(project_id).join(backup_id)
    }

    /// Number of snapshots begun but not yet diffed.
    pub fn open_snapshots(&self) -> usize {
        self.open_map().len()
    }

    /// Capture the manifest of `root` (and a copy of its files) under a fresh id.
    pub fn begin_backup(&self, project_id: &str, root: &Path) -> Result<String> {
        let backup_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let captured_manifest = build_manifest(root)?;

        if self.copy_files {
            let files_dir = self.backup_dir(project_id, &backup_id).join(FILES_DIR);
            if let Err(e) = copy_tree(root, &files_dir) {
                let _ = std::fs::remove_dir_all(self.backup_dir(project_id, &backup_id));
                return Err(e);
            }
        }

        debug!(
            project = %project_id,
            backup_id = %backup_id,
            files = captured_manifest.len(),
            "Opened backup snapshot"
        );

        self.open_map().insert(
            backup_id.clone(),
            BackupSnapshot {
                backup_id: backup_id.clone(),
                project_id: project_id.to_string(),
                root: root.to_path_buf(),
                created_at: Utc::now(),
                captured_manifest,
            },
        );

        Ok(backup_id)
    }

    /// Diff the library against snapshot `backup_id` and close it.
    ///
    /// The snapshot is closed even when computing the diff fails.
    pub fn check_diff(&self, project_id: &str, backup_id: &str) -> Result<ChangeSummary> {
        let snapshot = self
            .open_map()
            .remove(backup_id)
            .ok_or_else(|| AgentError::NotFound(format!("open backup {}", backup_id)))?;

        if snapshot.project_id != project_id {
            return Err(AgentError::InvalidArgument(format!(
                "backup {} belongs to project {}",
                backup_id, snapshot.project_id
            )));
        }

        let backup_dir = self.backup_dir(project_id, backup_id);
        let current = match build_manifest(&snapshot.root) {
            Ok(m) => m,
            Err(e) => {
                // Keep whatever was copied; it may be the only way back
                error!(project = %project_id, backup_id, "Failed to diff backup: {}", e);
                return Err(e.into());
            }
        };

        let summary = summarize(&snapshot, &current);

        if summary.is_empty() {
            remove_dir_if_present(&backup_dir)?;
            debug!(project = %project_id, backup_id, "No changes, backup discarded");
            return Ok(summary);
        }

        if self.copy_files {
            prune_unchanged_copies(&backup_dir.join(FILES_DIR), &summary)?;
        }
        std::fs::create_dir_all(&backup_dir)?;
        std::fs::write(
            backup_dir.join(SNAPSHOT_FILE),
            serde_json::to_vec_pretty(&snapshot)?,
        )?;
        std::fs::write(
            backup_dir.join(SUMMARY_FILE),
            serde_json::to_vec_pretty(&summary)?,
        )?;

        info!(
            project = %project_id,
            backup_id,
            added = summary.added.len(),
            modified = summary.modified.len(),
            removed = summary.removed.len(),
            "Backup retained"
        );
        Ok(summary)
    }

    /// Roll `root` back to the state captured by retained backup `backup_id`.
    ///
    /// Modified and removed files are copied back, added files deleted.
    /// Returns the number of paths touched.
    pub fn restore(&self, project_id: &str, backup_id: &str, root: &Path) -> Result<usize> {
        validate_name(backup_id)?;
        let backup_dir = self.backup_dir(project_id, backup_id);
        let raw = match std::fs::read(backup_dir.join(SUMMARY_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::NotFound(format!("backup {}", backup_id)));
            }
            Err(e) => return Err(e.into()),
        };
        let summary: ChangeSummary = serde_json::from_slice(&raw)?;

        let files_dir = backup_dir.join(FILES_DIR);
        let needs_copies = !summary.modified.is_empty() || !summary.removed.is_empty();
        if needs_copies && !files_dir.is_dir() {
            return Err(AgentError::PreconditionFailed(format!(
                "backup {} holds no file copies",
                backup_id
            )));
        }

        let mut touched = 0;
        for relative in summary.modified.iter().chain(summary.removed.iter()) {
            let source = resolve(&files_dir, &[relative])?;
            let target = resolve(root, &[relative])?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)?;
            touched += 1;
        }
        for relative in &summary.added {
            let target = resolve(root, &[relative])?;
            match std::fs::remove_file(&target) {
                Ok(()) => touched += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(project = %project_id, backup_id, touched, "Restored backup");
        Ok(touched)
    }
}

/// Scoped backup: opened before a mutation, closed exactly once afterwards.
///
/// Call [`BackupGuard::close`] to get the summary. A guard dropped without
/// closing (early return, panic) still runs the diff so the snapshot is
/// never left open.
pub struct BackupGuard {
    coordinator: Arc<BackupCoordinator>,
    project_id: String,
    backup_id: String,
    closed: bool,
}

impl BackupGuard {
    pub fn open(coordinator: Arc<BackupCoordinator>, project_id: &str, root: &Path) -> Result<Self> {
        let backup_id = coordinator.begin_backup(project_id, root)?;
        Ok(Self {
            coordinator,
            project_id: project_id.to_string(),
            backup_id,
            closed: false,
        })
    }

    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn close(mut self) -> Result<ChangeSummary> {
        self.closed = true;
        self.coordinator.check_diff(&self.project_id, &self.backup_id)
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(project = %self.project_id, backup_id = %self.backup_id, "Backup closed on drop");
        if let Err(e) = self.coordinator.check_diff(&self.project_id, &self.backup_id) {
            error!(backup_id = %self.backup_id, "Failed to close backup: {}", e);
        }
    }
}

fn summarize(snapshot: &BackupSnapshot, current: &Manifest) -> ChangeSummary {
    let before = &snapshot.captured_manifest;

    let mut added: Vec<String> = current
        .keys()
        .filter(|k| !before.contains_key(*k))
        .cloned()
        .collect();
    let mut modified: Vec<String> = current
        .iter()
        .filter(|(k, digest)| matches!(before.get(*k), Some(old) if old != *digest))
        .map(|(k, _)| k.clone())
        .collect();
    let mut removed: Vec<String> = before
        .keys()
        .filter(|k| !current.contains_key(*k))
        .cloned()
        .collect();

    added.sort();
    modified.sort();
    removed.sort();

    ChangeSummary {
        backup_id: snapshot.backup_id.clone(),
        project_id: snapshot.project_id.clone(),
        added,
        modified,
        removed,
    }
}

fn copy_tree(root: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for file in walk_directory(root)? {
        let target = resolve(dest, &[&file.relative_path])?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::copy(&file.path, &target) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Drop copies of files the mutation did not touch, then empty directories.
fn prune_unchanged_copies(files_dir: &Path, summary: &ChangeSummary) -> Result<()> {
    if !files_dir.is_dir() {
        return Ok(());
    }
    let keep: std::collections::HashSet<&str> = summary
        .modified
        .iter()
        .chain(summary.removed.iter())
        .map(String::as_str)
        .collect();

    for file in walk_directory(files_dir)? {
        if !keep.contains(file.relative_path.as_str()) {
            std::fs::remove_file(&file.path)?;
        }
    }

    for entry in WalkDir::new(files_dir).min_depth(1).contents_first(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() {
            // Fails harmlessly on directories that still hold kept copies
            let _ = std::fs::remove_dir(entry.path());
        }
    }
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
