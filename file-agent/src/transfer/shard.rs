//! Chunked upload reassembly.
//!
//! Large files arrive as independently retriable chunk puts followed by a
//! merge poll. Chunks of one session live under `<slices>/<slice_id>/` as
//! `<index>.part`, next to a `session.json` recording the target file name
//! and expected chunk count.
//!
//! Merge polling is idempotent: an incomplete session is left untouched, a
//! checksum mismatch discards only the merged output so the client can
//! re-send bad chunks and poll again. Each session gets a bounded number of
//! mismatches before its chunks are dropped, and sessions nobody touched
//! within the TTL are reaped by [`ShardAssembler::sweep_expired`].

use crate::fs::path::{resolve_name, validate_name};
use crate::utils::errors::{AgentError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SESSION_FILE: &str = "session.json";
const CHUNK_EXTENSION: &str = "part";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Persisted description of a session, written with its first chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    file_name: String,
    total_slice: u32,
    created_at: DateTime<Utc>,
}

/// Runtime state of a session. Guarded by the per-session merge lock.
#[derive(Debug, Default)]
struct MergeState {
    failed_attempts: u32,
}

struct SessionEntry {
    merge: Arc<Mutex<MergeState>>,
    last_touched: DateTime<Utc>,
}

/// Result of a successful merge, waiting to be placed by the caller.
#[derive(Debug)]
pub struct MergedFile {
    /// Merged file inside a private scratch directory
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    /// Lower-case hex MD5 of the merged content
    pub checksum: String,
    scratch_dir: PathBuf,
}

impl MergedFile {
    /// Remove the scratch directory (and the merged file, if still there).
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.scratch_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove merge scratch dir {}: {}", self.scratch_dir.display(), e);
            }
        }
    }
}

/// Assembler options, taken from the files config section
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub max_merge_attempts: u32,
    pub session_ttl: Duration,
}

pub struct ShardAssembler {
    slices_dir: PathBuf,
    temp_dir: PathBuf,
    options: ShardOptions,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl ShardAssembler {
    pub fn new(slices_dir: PathBuf, temp_dir: PathBuf, options: ShardOptions) -> Self {
        Self {
            slices_dir,
            temp_dir,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, slice_id: &str) -> Result<PathBuf> {
        resolve_name(&self.slices_dir, slice_id)
    }

    async fn touch(&self, slice_id: &str) -> Arc<Mutex<MergeState>> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entry(slice_id.to_string())
            .or_insert_with(|| SessionEntry {
                merge: Arc::new(Mutex::new(MergeState::default())),
                last_touched: Utc::now(),
            });
        entry.last_touched = Utc::now();
        entry.merge.clone()
    }

    /// Persist chunk `index` of session `slice_id`.
    ///
    /// Re-sending an index replaces the earlier copy. Completeness is not
    /// checked here.
    pub async fn put_chunk(
        &self,
        slice_id: &str,
        index: u32,
        total_slice: u32,
        file_name: &str,
        data: &[u8],
    ) -> Result<()> {
        if total_slice == 0 {
            return Err(AgentError::InvalidArgument("totalSlice must be positive".into()));
        }
        if index >= total_slice {
            return Err(AgentError::InvalidArgument(format!(
                "chunk index {} out of range for {} chunks",
                index, total_slice
            )));
        }
        validate_name(file_name)?;
        let dir = self.session_dir(slice_id)?;
        self.touch(slice_id).await;

        tokio::fs::create_dir_all(&dir).await?;
        self.record_meta(&dir, file_name, total_slice).await?;

        // Write aside then rename so a concurrent count never sees a torn chunk
        let final_path = chunk_path(&dir, index);
        let tmp_path = dir.join(format!("{}.{}.tmp", index, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        debug!(slice_id, index, total_slice, bytes = data.len(), "Stored chunk");
        Ok(())
    }

    async fn record_meta(&self, dir: &Path, file_name: &str, total_slice: u32) -> Result<()> {
        let meta_path = dir.join(SESSION_FILE);
        match tokio::fs::read(&meta_path).await {
            Ok(raw) => {
                let meta: SessionMeta = serde_json::from_slice(&raw)?;
                if meta.total_slice != total_slice {
                    return Err(AgentError::InvalidArgument(format!(
                        "session expects {} chunks, got totalSlice {}",
                        meta.total_slice, total_slice
                    )));
                }
                if meta.file_name != file_name {
                    return Err(AgentError::InvalidArgument(format!(
                        "session uploads {}, got chunk for {}",
                        meta.file_name, file_name
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let meta = SessionMeta {
                    file_name: file_name.to_string(),
                    total_slice,
                    created_at: Utc::now(),
                };
                tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// File name recorded by the first chunk of `slice_id`, if any arrived.
    pub async fn session_file_name(&self, slice_id: &str) -> Result<Option<String>> {
        let dir = self.session_dir(slice_id)?;
        match tokio::fs::read(dir.join(SESSION_FILE)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<SessionMeta>(&raw)?.file_name)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Path and size of chunk 0 of `slice_id`, if it has arrived.
    pub async fn first_chunk(&self, slice_id: &str) -> Result<Option<(PathBuf, u64)>> {
        let path = chunk_path(&self.session_dir(slice_id)?, 0);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(Some((path, metadata.len()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Try to merge session `slice_id` into one file.
    ///
    /// Merges of the same session are serialized; different sessions merge
    /// in parallel.
    pub async fn try_merge(
        &self,
        slice_id: &str,
        total_slice: u32,
        expected_checksum: &str,
    ) -> Result<MergedFile> {
        if total_slice == 0 {
            return Err(AgentError::InvalidArgument("totalSlice must be positive".into()));
        }
        let expected = expected_checksum.trim().to_ascii_lowercase();
        if expected.is_empty() {
            return Err(AgentError::InvalidArgument("checksum is required".into()));
        }
        let dir = self.session_dir(slice_id)?;

        let merge_lock = self.touch(slice_id).await;
        let mut state = merge_lock.lock().await;

        let meta = match tokio::fs::read(dir.join(SESSION_FILE)).await {
            Ok(raw) => serde_json::from_slice::<SessionMeta>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::Incomplete {
                    received: 0,
                    expected: total_slice as usize,
                });
            }
            Err(e) => return Err(e.into()),
        };
        if meta.total_slice != total_slice {
            return Err(AgentError::InvalidArgument(format!(
                "session expects {} chunks, got totalSlice {}",
                meta.total_slice, total_slice
            )));
        }

        let received = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || count_chunks(&dir, total_slice)).await??
        };
        if received < total_slice as usize {
            debug!(slice_id, received, total_slice, "Merge requested before all chunks arrived");
            return Err(AgentError::Incomplete {
                received,
                expected: total_slice as usize,
            });
        }

        let scratch_dir = self.temp_dir.join(format!("merge-{}", uuid::Uuid::new_v4()));
        let output = scratch_dir.join(&meta.file_name);
        let (size, actual) = {
            let dir = dir.clone();
            let scratch_dir = scratch_dir.clone();
            let output = output.clone();
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&scratch_dir)?;
                concat_chunks(&dir, total_slice, &output)
            })
            .await??
        };

        if actual != expected {
            let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
            state.failed_attempts += 1;
            let exhausted = state.failed_attempts >= self.options.max_merge_attempts;
            warn!(
                slice_id,
                attempt = state.failed_attempts,
                exhausted,
                "Merged checksum mismatch (expected {}, got {})",
                expected,
                actual
            );
            if exhausted {
                drop(state);
                self.discard(slice_id, &dir).await;
            }
            return Err(AgentError::ChecksumMismatch {
                expected,
                actual,
                retries_exhausted: exhausted,
            });
        }

        drop(state);
        self.discard(slice_id, &dir).await;

        info!(slice_id, file = %meta.file_name, size, "Merged {} chunks", total_slice);
        Ok(MergedFile {
            path: output,
            file_name: meta.file_name,
            size,
            checksum: actual,
            scratch_dir,
        })
    }

    async fn discard(&self, slice_id: &str, dir: &Path) {
        self.sessions.lock().await.remove(slice_id);
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove session dir {}: {}", dir.display(), e);
            }
        }
    }

    /// Reap sessions idle for longer than the TTL. Returns how many were removed.
    ///
    /// Sessions known to this process are aged by their last chunk or merge
    /// poll; leftover directories from an earlier run by their mtime. A
    /// session with a merge in flight is skipped.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let ttl = ChronoDuration::from_std(self.options.session_ttl)
            .unwrap_or_else(|_| ChronoDuration::days(1));
        let cutoff = now - ttl;
        let mut reaped = 0usize;

        let (expired, known): (Vec<String>, Vec<String>) = {
            let mut sessions = self.sessions.lock().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| e.last_touched < cutoff && e.merge.try_lock().is_ok())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            (expired, sessions.keys().cloned().collect())
        };

        for id in expired {
            let dir = self.slices_dir.join(&id);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => reaped += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to reap session {}: {}", id, e),
            }
        }

        let mut entries = match tokio::fs::read_dir(&self.slices_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(reaped),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().to_string();
            if known.contains(&id) {
                continue;
            }
            let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
            if modified < cutoff {
                match tokio::fs::remove_dir_all(entry.path()).await {
                    Ok(()) => reaped += 1,
                    Err(e) => warn!("Failed to reap orphaned session {}: {}", id, e),
                }
            }
        }

        if reaped > 0 {
            info!("Reaped {} expired upload sessions", reaped);
        }
        Ok(reaped)
    }

    /// Number of sessions tracked in memory.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{}.{}", index, CHUNK_EXTENSION))
}

/// Count distinct chunk indices below `total_slice` present in `dir`.
fn count_chunks(dir: &Path, total_slice: u32) -> std::io::Result<usize> {
    let mut count = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let index = name
            .strip_suffix(CHUNK_EXTENSION)
            .and_then(|stem| stem.strip_suffix('.'))
            .and_then(|stem| stem.parse::<u32>().ok());
        if matches!(index, Some(i) if i < total_slice) {
            count += 1;
        }
    }
    Ok(count)
}

/// Concatenate chunks 0..total in order into `output`, returning size and MD5.
fn concat_chunks(dir: &Path, total_slice: u32, output: &Path) -> std::io::Result<(u64, String)> {
    let mut writer = BufWriter::new(File::create(output)?);
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut size = 0u64;

    for index in 0..total_slice {
        let mut chunk = File::open(chunk_path(dir, index))?;
        loop {
            let n = chunk.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            context.consume(&buffer[..n]);
            writer.write_all(&buffer[..n])?;
            size += n as u64;
        }
    }
    writer.flush()?;

    Ok((size, format!("{:x}", context.compute())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn assembler(root: &Path, attempts: u32) -> ShardAssembler {
        ShardAssembler::new(
            root.join("slices"),
            root.join("tmp"),
            ShardOptions {
                max_merge_attempts: attempts,
                session_ttl: Duration::from_secs(3600),
            },
        )
    }

    fn md5_hex(data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }

    #[tokio::test]
    async fn test_merge_out_of_order_with_duplicates() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = assembler(dir.path(), 5);

        shards.put_chunk("s1", 2, 3, "app.bin", b"CCC").await?;
        shards.put_chunk("s1", 0, 3, "app.bin", b"xxx").await?;
        shards.put_chunk("s1", 1, 3, "app.bin", b"BBB").await?;
        // Last write for index 0 wins
        shards.put_chunk("s1", 0, 3, "app.bin", b"AAA").await?;

        let merged = shards.try_merge("s1", 3, &md5_hex(b"AAABBBCCC")).await?;
        assert_eq!(merged.file_name, "app.bin");
        assert_eq!(merged.size, 9);
        assert_eq!(std::fs::read(&merged.path)?, b"AAABBBCCC");
        assert!(!dir.path().join("slices/s1").exists());
        assert_eq!(shards.active_sessions().await, 0);

        merged.cleanup();
        assert!(!merged.path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_incomplete_merge_keeps_chunks() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = assembler(dir.path(), 5);

        shards.put_chunk("s2", 0, 3, "f", b"A").await?;
        shards.put_chunk("s2", 2, 3, "f", b"C").await?;

        let err = shards.try_merge("s2", 3, &md5_hex(b"ABC")).await.unwrap_err();
        assert!(matches!(err, AgentError::Incomplete { received: 2, expected: 3 }));
        assert!(err.retryable());
        assert!(dir.path().join("slices/s2/0.part").exists());
        assert!(dir.path().join("slices/s2/2.part").exists());

        shards.put_chunk("s2", 1, 3, "f", b"B").await?;
        let merged = shards.try_merge("s2", 3, &md5_hex(b"ABC")).await?;
        assert_eq!(std::fs::read(&merged.path)?, b"ABC");
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_session_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let shards = assembler(dir.path(), 5);
        let err = shards.try_merge("never", 2, "abc").await.unwrap_err();
        assert!(matches!(err, AgentError::Incomplete { received: 0, expected: 2 }));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_chunks_for_retry() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = assembler(dir.path(), 5);

        shards.put_chunk("s3", 0, 2, "f", b"good").await?;
        shards.put_chunk("s3", 1, 2, "f", b"bad!").await?;

        let expected = md5_hex(b"goodpart");
        let err = shards.try_merge("s3", 2, &expected).await.unwrap_err();
        assert!(matches!(err, AgentError::ChecksumMismatch { retries_exhausted: false, .. }));
        assert!(dir.path().join("slices/s3/0.part").exists());
        assert!(dir.path().join("slices/s3/1.part").exists());

        // Re-send the corrupt chunk and poll again; checksum compare ignores case
        shards.put_chunk("s3", 1, 2, "f", b"part").await?;
        let merged = shards.try_merge("s3", 2, &expected.to_uppercase()).await?;
        assert_eq!(std::fs::read(&merged.path)?, b"goodpart");
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_budget_discards_session() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = assembler(dir.path(), 2);

        shards.put_chunk("s4", 0, 1, "f", b"data").await?;
        let first = shards.try_merge("s4", 1, "0000").await.unwrap_err();
        assert!(first.retryable());
        let second = shards.try_merge("s4", 1, "0000").await.unwrap_err();
        assert!(matches!(second, AgentError::ChecksumMismatch { retries_exhausted: true, .. }));
        assert!(!dir.path().join("slices/s4").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_session_file_name() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = assembler(dir.path(), 5);

        assert_eq!(shards.session_file_name("s5").await?, None);
        shards.put_chunk("s5", 1, 2, "site.tar.gz", b"B").await?;
        assert_eq!(shards.session_file_name("s5").await?.as_deref(), Some("site.tar.gz"));
        assert!(shards.first_chunk("s5").await?.is_none());
        shards.put_chunk("s5", 0, 2, "site.tar.gz", b"AA").await?;
        let (path, size) = shards.first_chunk("s5").await?.unwrap();
        assert_eq!(size, 2);
        assert_eq!(std::fs::read(path)?, b"AA");
        assert!(matches!(
            shards.session_file_name("..").await,
            Err(AgentError::InvalidPath(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_put_chunk_validation() {
        let dir = TempDir::new().unwrap();
        let shards = assembler(dir.path(), 5);

        assert!(matches!(
            shards.put_chunk("s", 3, 3, "f", b"x").await,
            Err(AgentError::InvalidArgument(_))
        ));
        assert!(matches!(
            shards.put_chunk("../evil", 0, 1, "f", b"x").await,
            Err(AgentError::InvalidPath(_))
        ));
        assert!(matches!(
            shards.put_chunk("s", 0, 1, "../f", b"x").await,
            Err(AgentError::InvalidPath(_))
        ));

        shards.put_chunk("s", 0, 2, "f", b"x").await.unwrap();
        assert!(matches!(
            shards.put_chunk("s", 1, 3, "f", b"x").await,
            Err(AgentError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_merges_of_one_session() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = Arc::new(assembler(dir.path(), 5));
        shards.put_chunk("s5", 0, 1, "f", b"payload").await?;

        let checksum = md5_hex(b"payload");
        let a = {
            let shards = shards.clone();
            let checksum = checksum.clone();
            tokio::spawn(async move { shards.try_merge("s5", 1, &checksum).await })
        };
        let b = {
            let shards = shards.clone();
            tokio::spawn(async move { shards.try_merge("s5", 1, &checksum).await })
        };

        let results = [a.await?, b.await?];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        // The loser finds the session already merged and gone
        assert_eq!(ok, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AgentError::Incomplete { received: 0, .. }))));
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_expired_sessions() -> Result<()> {
        let dir = TempDir::new()?;
        let shards = assembler(dir.path(), 5);

        shards.put_chunk("old", 0, 2, "f", b"x").await?;
        // A directory left behind by an earlier process
        std::fs::create_dir_all(dir.path().join("slices/orphan"))?;

        assert_eq!(shards.sweep_expired(Utc::now()).await?, 0);

        let later = Utc::now() + ChronoDuration::hours(2);
        assert_eq!(shards.sweep_expired(later).await?, 2);
        assert!(!dir.path().join("slices/old").exists());
        assert!(!dir.path().join("slices/orphan").exists());
        assert_eq!(shards.active_sessions().await, 0);
        Ok(())
    }
}
