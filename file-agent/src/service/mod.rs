//! File mutation service.
//!
//! Every operation the controlling server can invoke on a project's files.
//! Mutations run the same pipeline:
//!
//! 1. validate and resolve paths (nothing is touched on failure)
//! 2. take the project's mutation lock
//! 3. stop the managed process when `closeFirst` was requested
//! 4. open a backup, mutate, close the backup
//! 5. publish the backup diff, then the change event on success
//! 6. apply the after-action
//!
//! A mutation failing after it changed files is reported as
//! [`AgentError::PartiallyApplied`] carrying the change summary.

pub mod after_action;
pub mod collaborators;
#[cfg(test)]
mod tests;

pub use after_action::{AfterAction, AfterActionReport};
pub use collaborators::{
    ChangeKind, ChangeNotifier, CommandProcessControl, FileChangeEvent, ProcessControl,
};

use crate::backup::{BackupCoordinator, BackupGuard, ChangeSummary};
use crate::config::Config;
use crate::fs::path::{relative_slash_path, resolve, resolve_name, validate_name};
use crate::fs::walker::list_directory;
use crate::sync::manifest::manifest_from_entries;
use crate::sync::{build_manifest, diff, DiffResult, FileManifestEntry};
use crate::transfer::archive::{self, ArchiveFormat};
use crate::transfer::progress::format_bytes;
use crate::transfer::remote::RemoteFetcher;
use crate::transfer::shard::{ShardAssembler, ShardOptions};
use crate::utils::errors::{AgentError, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// One row of a directory listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// RFC 3339
    pub modified_time: String,
    pub is_dir: bool,
    pub editable: bool,
}

/// Placement options shared by uploads, merges and remote fetches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadOptions {
    /// Destination directory relative to the project root
    pub dest_subdir: String,
    pub extract: bool,
    pub strip_components: usize,
    pub after_action: AfterAction,
    /// Stop the managed process before touching any file
    pub close_first: bool,
    /// Empty the destination directory first (inside the backup)
    pub clear: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub slice_id: String,
    pub total_slice: u32,
    #[serde(alias = "fileSumMd5")]
    pub checksum: String,
    #[serde(flatten)]
    pub options: UploadOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFetchRequest {
    pub url: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub extract: bool,
    #[serde(default)]
    pub strip_components: usize,
    /// Overrides the configured download timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Structured result of a successful mutation
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationReport {
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<ChangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_action: Option<AfterActionReport>,
}

/// A file ready to be streamed to the caller
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

struct Mutation {
    event: FileChangeEvent,
    after_action: AfterAction,
    close_first: bool,
}

struct Inner {
    config: Arc<Config>,
    backups: Arc<BackupCoordinator>,
    shards: ShardAssembler,
    fetcher: RemoteFetcher,
    notifier: Arc<dyn ChangeNotifier>,
    process: Arc<dyn ProcessControl>,
    project_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Clone)]
pub struct FileMutationService {
    inner: Arc<Inner>,
}

impl FileMutationService {
    pub fn new(
        config: Arc<Config>,
        notifier: Arc<dyn ChangeNotifier>,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        let shards = ShardAssembler::new(
            config.slices_dir(),
            config.temp_dir(),
            ShardOptions {
                max_merge_attempts: config.files.max_merge_attempts.max(1),
                session_ttl: Duration::from_secs(config.files.session_ttl_secs),
            },
        );
        let fetcher = RemoteFetcher::new(
            config.temp_dir(),
            Duration::from_secs(config.files.download_timeout_secs),
        );
        let backups = Arc::new(BackupCoordinator::new(
            config.backups_dir(),
            config.backup.copy_files,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                backups,
                shards,
                fetcher,
                notifier,
                process,
                project_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshots currently open across all projects.
    pub fn open_backups(&self) -> usize {
        self.inner.backups.open_snapshots()
    }

    /// Reap abandoned chunk sessions.
    pub async fn sweep_expired_sessions(&self) -> Result<usize> {
        self.inner.shards.sweep_expired(Utc::now()).await
    }

    /// Whether `name` passes the edit suffix allow list.
    pub fn is_editable(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.inner
            .config
            .files
            .allowed_edit_suffixes
            .iter()
            .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
            .any(|suffix| suffix == "*" || (!suffix.is_empty() && lower.ends_with(&format!(".{}", suffix))))
    }

    fn project_root(&self, project_id: &str) -> Result<PathBuf> {
        Ok(self.inner.config.project(project_id)?.path.clone())
    }

    /// Project root plus the resolved path of `segments` under it.
    fn resolve_in<S: AsRef<str>>(&self, project_id: &str, segments: &[S]) -> Result<(PathBuf, PathBuf)> {
        let root = self.project_root(project_id)?;
        let path = resolve(&root, segments)?;
        Ok((root, path))
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.project_locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Read-only operations
    // ------------------------------------------------------------------

    pub async fn list_files(&self, project_id: &str, dir: &str) -> Result<Vec<FileEntry>> {
        let (_, dir_path) = self.resolve_in(project_id, &[dir])?;
        let children = tokio::task::spawn_blocking(move || list_directory(&dir_path)).await??;

        Ok(children
            .into_iter()
            .map(|child| FileEntry {
                editable: !child.metadata.is_dir && self.is_editable(&child.name),
                size: child.metadata.size,
                modified_time: child.metadata.modified.to_rfc3339_opts(SecondsFormat::Secs, true),
                is_dir: child.metadata.is_dir,
                name: child.name,
            })
            .collect())
    }

    pub async fn diff_files(
        &self,
        project_id: &str,
        dir: &str,
        client_manifest: &[FileManifestEntry],
    ) -> Result<DiffResult> {
        let (_, dir_path) = self.resolve_in(project_id, &[dir])?;
        let server = tokio::task::spawn_blocking(move || build_manifest(&dir_path)).await??;
        let result = diff(&manifest_from_entries(client_manifest), &server);

        info!(
            project = %project_id,
            dir,
            to_sync = result.to_sync.len(),
            to_delete = result.to_delete.len(),
            "Computed manifest diff"
        );
        Ok(result)
    }

    pub async fn read_text_file(&self, project_id: &str, dir: &str, name: &str) -> Result<String> {
        self.check_editable(name)?;
        validate_name(name)?;
        let (_, path) = self.resolve_in(project_id, &[dir, name])?;

        let metadata = existing_metadata(&path, dir, name).await?;
        if metadata.is_dir() {
            return Err(AgentError::InvalidArgument(format!("{} is a directory", name)));
        }
        let raw = tokio::fs::read(&path).await?;
        String::from_utf8(raw)
            .map_err(|_| AgentError::InvalidArgument(format!("{} is not valid UTF-8 text", name)))
    }

    pub async fn download_file(&self, project_id: &str, dir: &str, name: &str) -> Result<DownloadTarget> {
        validate_name(name)?;
        let (_, path) = self.resolve_in(project_id, &[dir, name])?;

        let metadata = existing_metadata(&path, dir, name).await?;
        if metadata.is_dir() {
            return Err(AgentError::InvalidArgument(format!("{} is a directory", name)));
        }
        Ok(DownloadTarget {
            path,
            file_name: name.to_string(),
            size: metadata.len(),
        })
    }

    fn check_editable(&self, name: &str) -> Result<()> {
        if self.is_editable(name) {
            Ok(())
        } else {
            Err(AgentError::NotEditable(name.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    pub async fn put_chunk(
        &self,
        project_id: &str,
        slice_id: &str,
        index: u32,
        total_slice: u32,
        file_name: &str,
        data: &[u8],
    ) -> Result<()> {
        self.project_root(project_id)?;
        self.check_upload_size(data.len())?;
        self.inner
            .shards
            .put_chunk(slice_id, index, total_slice, file_name, data)
            .await
    }

    /// Merge a chunk session and place the result.
    ///
    /// An incomplete session or checksum mismatch returns before any backup
    /// is opened.
    pub async fn merge_chunks(&self, project_id: &str, request: &MergeRequest) -> Result<MutationReport> {
        let options = &request.options;
        let (root, dest_dir) = self.resolve_in(project_id, &[&options.dest_subdir])?;
        if options.extract {
            self.check_session_format(&request.slice_id).await?;
        }

        let merged = self
            .inner
            .shards
            .try_merge(&request.slice_id, request.total_slice, &request.checksum)
            .await?;

        let event = FileChangeEvent::new(project_id, ChangeKind::Merge, &options.dest_subdir)
            .with_file_name(&merged.file_name);
        let result = self
            .store_staged(project_id, root, dest_dir, merged.path.clone(), merged.file_name.clone(), options, event)
            .await;
        merged.cleanup();
        result
    }

    /// Reject an archive of unknown format while its chunks are still kept.
    ///
    /// The recorded file name decides first. Without a known extension the
    /// leading bytes of chunk 0 are sniffed, provided enough of them arrived;
    /// otherwise the check is left to the merged file.
    async fn check_session_format(&self, slice_id: &str) -> Result<()> {
        let shards = &self.inner.shards;
        let Some(file_name) = shards.session_file_name(slice_id).await? else {
            return Ok(());
        };
        if ArchiveFormat::from_name(&file_name).is_some() {
            return Ok(());
        }
        let Some((first, size)) = shards.first_chunk(slice_id).await? else {
            return Ok(());
        };
        if size < archive::SNIFF_LEN as u64 {
            return Ok(());
        }
        match tokio::task::spawn_blocking(move || ArchiveFormat::sniff(&first)).await?? {
            Some(_) => Ok(()),
            None => Err(AgentError::UnsupportedFormat(file_name)),
        }
    }

    /// Single-shot upload of a whole file.
    pub async fn upload_file(
        &self,
        project_id: &str,
        file_name: &str,
        data: &[u8],
        options: &UploadOptions,
    ) -> Result<MutationReport> {
        validate_name(file_name)?;
        self.check_upload_size(data.len())?;
        let (root, dest_dir) = self.resolve_in(project_id, &[&options.dest_subdir])?;

        let scratch = self
            .inner
            .config
            .temp_dir()
            .join(format!("upload-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;
        let staged = scratch.join(file_name);

        let result = match tokio::fs::write(&staged, data).await {
            Ok(()) => {
                let event = FileChangeEvent::new(project_id, ChangeKind::Upload, &options.dest_subdir)
                    .with_file_name(file_name);
                self.store_staged(project_id, root, dest_dir, staged, file_name.to_string(), options, event)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Failed to remove upload scratch dir {}: {}", scratch.display(), e);
        }
        result
    }

    /// Download `request.url` and store (or extract) it under `request.dir`.
    pub async fn fetch_remote_and_store(
        &self,
        project_id: &str,
        request: &RemoteFetchRequest,
    ) -> Result<MutationReport> {
        let (root, dest_dir) = self.resolve_in(project_id, &[&request.dir])?;

        let downloaded = self
            .inner
            .fetcher
            .fetch(&request.url, request.timeout_secs.map(Duration::from_secs))
            .await?;

        let options = UploadOptions {
            dest_subdir: request.dir.clone(),
            extract: request.extract,
            strip_components: request.strip_components,
            ..Default::default()
        };
        let event = FileChangeEvent::new(project_id, ChangeKind::Remote, &request.dir)
            .with_file_name(&downloaded.file_name)
            .with_url(&request.url);
        let result = self
            .store_staged(
                project_id,
                root,
                dest_dir,
                downloaded.path.clone(),
                downloaded.file_name.clone(),
                &options,
                event,
            )
            .await;
        downloaded.cleanup();
        result
    }

    fn check_upload_size(&self, len: usize) -> Result<()> {
        let limit = self.inner.config.files.max_upload_bytes;
        if len > limit {
            return Err(AgentError::InvalidArgument(format!(
                "upload of {} exceeds the {} limit",
                format_bytes(len as u64),
                format_bytes(limit as u64)
            )));
        }
        Ok(())
    }

    /// Move or extract a staged file into `dest_dir` through the mutation pipeline.
    #[allow(clippy::too_many_arguments)]
    async fn store_staged(
        &self,
        project_id: &str,
        root: PathBuf,
        dest_dir: PathBuf,
        source: PathBuf,
        file_name: String,
        options: &UploadOptions,
        event: FileChangeEvent,
    ) -> Result<MutationReport> {
        if options.extract {
            // Reject unknown formats before anything is cleared or backed up
            let staged = source.clone();
            tokio::task::spawn_blocking(move || ArchiveFormat::detect(&staged)).await??;
        }

        let mutation = Mutation {
            event,
            after_action: options.after_action,
            close_first: options.close_first,
        };
        let options = options.clone();
        self.run_mutation(project_id, root, mutation, move |_| {
            place_staged(&source, &file_name, &dest_dir, &options)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Tree edits
    // ------------------------------------------------------------------

    /// Delete `dir/name`, or `dir` itself when no name is given.
    pub async fn delete_file(&self, project_id: &str, dir: &str, name: Option<&str>) -> Result<MutationReport> {
        let (root, target) = match name {
            Some(name) => {
                validate_name(name)?;
                self.resolve_in(project_id, &[dir, name])?
            }
            None => self.resolve_in(project_id, &[dir])?,
        };
        if target == root {
            return Err(AgentError::InvalidArgument("refusing to delete the project root".into()));
        }
        let relative = relative_slash_path(&root, &target);
        if tokio::fs::symlink_metadata(&target).await.is_err() {
            return Err(AgentError::NotFound(relative));
        }

        let mut event = FileChangeEvent::new(project_id, ChangeKind::Delete, dir);
        if let Some(name) = name {
            event = event.with_file_name(name);
        }
        let process = self.inner.process.clone();
        let project = project_id.to_string();
        self.run_mutation(project_id, root, plain(event), move |_| {
            remove_path(&target).map_err(|e| delete_failure(process.as_ref(), &project, &target, e))?;
            Ok((format!("deleted {}", relative), None))
        })
        .await
    }

    /// Delete every entry inside `dir`, keeping `dir` itself.
    pub async fn delete_all(&self, project_id: &str, dir: &str) -> Result<MutationReport> {
        let (root, dir_path) = self.resolve_in(project_id, &[dir])?;
        if !tokio::fs::metadata(&dir_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(AgentError::NotFound(relative_slash_path(&root, &dir_path)));
        }

        let event = FileChangeEvent::new(project_id, ChangeKind::DeleteAll, dir);
        let process = self.inner.process.clone();
        let project = project_id.to_string();
        self.run_mutation(project_id, root, plain(event), move |_| {
            let mut deleted = 0;
            for entry in std::fs::read_dir(&dir_path)? {
                let path = entry?.path();
                remove_path(&path).map_err(|e| delete_failure(process.as_ref(), &project, &path, e))?;
                deleted += 1;
            }
            Ok((format!("deleted {} entries", deleted), None))
        })
        .await
    }

    /// Delete `names` inside `dir`. Names already gone are skipped.
    ///
    /// Names are paths relative to `dir` (as listed in a diff's `to_delete`),
    /// so nested entries like `conf/stale.yml` are accepted.
    pub async fn batch_delete(&self, project_id: &str, dir: &str, names: &[String]) -> Result<MutationReport> {
        if names.is_empty() {
            return Err(AgentError::InvalidArgument("names must not be empty".into()));
        }
        let (root, dir_path) = self.resolve_in(project_id, &[dir])?;
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let path = resolve(&dir_path, &[name])?;
            if path == dir_path {
                return Err(AgentError::InvalidPath(name.clone()));
            }
            targets.push(path);
        }

        let event = FileChangeEvent::new(project_id, ChangeKind::BatchDelete, dir);
        let process = self.inner.process.clone();
        let project = project_id.to_string();
        self.run_mutation(project_id, root, plain(event), move |_| {
            let mut deleted = 0;
            for path in &targets {
                if std::fs::symlink_metadata(path).is_err() {
                    continue;
                }
                remove_path(path).map_err(|e| delete_failure(process.as_ref(), &project, path, e))?;
                deleted += 1;
            }
            Ok((format!("deleted {} of {} entries", deleted, targets.len()), None))
        })
        .await
    }

    pub async fn rename_file(
        &self,
        project_id: &str,
        dir: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<MutationReport> {
        let (root, dir_path) = self.resolve_in(project_id, &[dir])?;
        let source = resolve_name(&dir_path, old_name)?;
        let target = resolve_name(&dir_path, new_name)?;

        if tokio::fs::symlink_metadata(&source).await.is_err() {
            return Err(AgentError::NotFound(relative_slash_path(&root, &source)));
        }
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(AgentError::AlreadyExists(relative_slash_path(&root, &target)));
        }

        let event = FileChangeEvent::new(project_id, ChangeKind::Rename, dir).with_file_name(new_name);
        let detail = format!("renamed {} to {}", old_name, new_name);
        self.run_mutation(project_id, root, plain(event), move |_| {
            std::fs::rename(&source, &target)?;
            Ok((detail, None))
        })
        .await
    }

    pub async fn create_entry(
        &self,
        project_id: &str,
        dir: &str,
        name: &str,
        is_directory: bool,
    ) -> Result<MutationReport> {
        let (root, dir_path) = self.resolve_in(project_id, &[dir])?;
        let target = resolve_name(&dir_path, name)?;
        let relative = relative_slash_path(&root, &target);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(AgentError::AlreadyExists(relative));
        }

        let event = FileChangeEvent::new(project_id, ChangeKind::Create, dir).with_file_name(name);
        self.run_mutation(project_id, root, plain(event), move |_| {
            if is_directory {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::AlreadyExists => AgentError::AlreadyExists(relative.clone()),
                        _ => e.into(),
                    })?;
            }
            Ok((format!("created {}", relative), None))
        })
        .await
    }

    pub async fn write_text_file(
        &self,
        project_id: &str,
        dir: &str,
        name: &str,
        text: String,
    ) -> Result<MutationReport> {
        self.check_editable(name)?;
        validate_name(name)?;
        let (root, path) = self.resolve_in(project_id, &[dir, name])?;

        if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(AgentError::InvalidArgument(format!("{} is a directory", name)));
        }
        let parent_exists = match path.parent() {
            Some(parent) => tokio::fs::metadata(parent).await.map(|m| m.is_dir()).unwrap_or(false),
            None => false,
        };
        if !parent_exists {
            return Err(AgentError::NotFound(dir.to_string()));
        }

        let event = FileChangeEvent::new(project_id, ChangeKind::Write, dir).with_file_name(name);
        let relative = relative_slash_path(&root, &path);
        self.run_mutation(project_id, root, plain(event), move |_| {
            std::fs::write(&path, text.as_bytes())?;
            Ok((format!("wrote {}", relative), Some(text.len() as u64)))
        })
        .await
    }

    /// Roll the project back to a retained backup.
    pub async fn restore_backup(&self, project_id: &str, backup_id: &str) -> Result<MutationReport> {
        validate_name(backup_id)?;
        let root = self.project_root(project_id)?;

        let event = FileChangeEvent::new(project_id, ChangeKind::Restore, "");
        let backups = self.inner.backups.clone();
        let project = project_id.to_string();
        let backup_id = backup_id.to_string();
        self.run_mutation(project_id, root, plain(event), move |root| {
            let touched = backups.restore(&project, &backup_id, root)?;
            Ok((format!("restored {} paths from backup {}", touched, backup_id), None))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn run_mutation<F>(
        &self,
        project_id: &str,
        root: PathBuf,
        mutation: Mutation,
        op: F,
    ) -> Result<MutationReport>
    where
        F: FnOnce(&Path) -> Result<(String, Option<u64>)> + Send + 'static,
    {
        let lock = self.project_lock(project_id).await;
        let _held = lock.lock().await;

        if mutation.close_first {
            self.stop_process(project_id).await?;
        }

        let backups = self.inner.backups.clone();
        let project = project_id.to_string();
        let (outcome, closed) = tokio::task::spawn_blocking(move || {
            let guard = BackupGuard::open(backups, &project, &root)?;
            let outcome = op(&root);
            Ok::<_, AgentError>((outcome, guard.close()))
        })
        .await??;

        let changes = match closed {
            Ok(summary) => {
                if !summary.is_empty() {
                    self.inner.notifier.backup_diff(&summary);
                }
                Some(summary)
            }
            Err(e) => {
                error!(project = %project_id, "Failed to close backup: {}", e);
                None
            }
        };

        let (detail, bytes) = match outcome {
            Ok(done) => done,
            Err(e) => {
                warn!(project = %project_id, kind = ?mutation.event.kind, "Mutation failed: {}", e);
                return Err(partial(changes, e));
            }
        };

        self.inner.notifier.file_changed(&mutation.event);

        let after_action = match self.apply_after_action(project_id, mutation.after_action).await {
            Ok(report) => report,
            Err(e) => return Err(partial(changes, e)),
        };

        info!(project = %project_id, kind = ?mutation.event.kind, "{}", detail);
        Ok(MutationReport {
            detail,
            bytes,
            changes,
            after_action,
        })
    }

    async fn stop_process(&self, project_id: &str) -> Result<()> {
        let process = self.inner.process.clone();
        let project = project_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let running = process.is_running(&project).map_err(|e| {
                AgentError::PreconditionFailed(format!("cannot tell whether {} is running: {}", project, e))
            })?;
            if running {
                info!(project = %project, "Stopping process before upload");
                process.stop(&project).map_err(|e| {
                    AgentError::PreconditionFailed(format!("failed to stop {}: {}", project, e))
                })?;
            }
            Ok(())
        })
        .await?
    }

    async fn apply_after_action(
        &self,
        project_id: &str,
        action: AfterAction,
    ) -> Result<Option<AfterActionReport>> {
        if action == AfterAction::None {
            return Ok(None);
        }
        let process = self.inner.process.clone();
        let project = project_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<AfterActionReport>> {
            let restart = |process: &dyn ProcessControl| {
                let result = process.restart(&project);
                AfterActionReport {
                    action,
                    performed: true,
                    success: result.is_ok(),
                    message: result.err().map(|e| e.to_string()),
                }
            };

            let report = match action {
                AfterAction::None => return Ok(None),
                AfterAction::Restart => restart(process.as_ref()),
                AfterAction::RestartIfRunning => match process.is_running(&project) {
                    Ok(true) => restart(process.as_ref()),
                    Ok(false) => AfterActionReport {
                        action,
                        performed: false,
                        success: true,
                        message: Some("process not running".to_string()),
                    },
                    Err(e) => AfterActionReport {
                        action,
                        performed: false,
                        success: false,
                        message: Some(e.to_string()),
                    },
                },
                AfterAction::MustRestart => {
                    process.restart(&project).map_err(|e| {
                        AgentError::Process(format!("required restart of {} failed: {}", project, e))
                    })?;
                    AfterActionReport {
                        action,
                        performed: true,
                        success: true,
                        message: None,
                    }
                }
            };
            if !report.success {
                warn!(project = %project, action = %action, "After-action failed: {:?}", report.message);
            }
            Ok(Some(report))
        })
        .await?
    }
}

fn plain(event: FileChangeEvent) -> Mutation {
    Mutation {
        event,
        after_action: AfterAction::None,
        close_first: false,
    }
}

fn partial(changes: Option<ChangeSummary>, source: AgentError) -> AgentError {
    match changes {
        Some(changes) if !changes.is_empty() => AgentError::PartiallyApplied {
            changes,
            source: Box::new(source),
        },
        _ => source,
    }
}

async fn existing_metadata(path: &Path, dir: &str, name: &str) -> Result<std::fs::Metadata> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(AgentError::NotFound(format!("{}/{}", dir.trim_end_matches('/'), name)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Map a failed delete: a running process holding the file is a precondition failure.
fn delete_failure(process: &dyn ProcessControl, project_id: &str, path: &Path, e: io::Error) -> AgentError {
    if process.is_running(project_id).unwrap_or(false) {
        AgentError::PreconditionFailed(format!(
            "cannot delete {} while the process is running: {}",
            path.display(),
            e
        ))
    } else {
        e.into()
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

fn clear_directory(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        remove_path(&entry?.path())?;
        removed += 1;
    }
    Ok(removed)
}

/// Rename into place, falling back to copy + remove across filesystems.
fn move_file(source: &Path, target: &Path) -> io::Result<u64> {
    if let Err(e) = std::fs::rename(source, target) {
        warn!("rename {} failed ({}), copying instead", source.display(), e);
        std::fs::copy(source, target)?;
        if let Err(e) = std::fs::remove_file(source) {
            warn!("Failed to remove staged file {}: {}", source.display(), e);
        }
    }
    Ok(std::fs::metadata(target)?.len())
}

fn place_staged(
    source: &Path,
    file_name: &str,
    dest_dir: &Path,
    options: &UploadOptions,
) -> Result<(String, Option<u64>)> {
    if options.clear {
        let removed = clear_directory(dest_dir)?;
        info!("Cleared {} entries from {}", removed, dest_dir.display());
    }
    std::fs::create_dir_all(dest_dir)?;

    if options.extract {
        let report = archive::extract(source, dest_dir, options.strip_components)?;
        return Ok((
            format!("extracted {} files from {}", report.files, file_name),
            Some(report.bytes),
        ));
    }

    let target = dest_dir.join(file_name);
    if target.is_dir() {
        return Err(AgentError::AlreadyExists(format!("{} is a directory", file_name)));
    }
    let size = move_file(source, &target)?;
    Ok((format!("stored {} ({})", file_name, format_bytes(size)), Some(size)))
}
