use super::*;
use crate::config::ProjectConfig;
use crate::sync::manifest::hash_bytes;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingNotifier {
    changes: StdMutex<Vec<FileChangeEvent>>,
    diffs: StdMutex<Vec<ChangeSummary>>,
}

impl ChangeNotifier for RecordingNotifier {
    fn file_changed(&self, event: &FileChangeEvent) {
        self.changes.lock().unwrap().push(event.clone());
    }

    fn backup_diff(&self, summary: &ChangeSummary) {
        self.diffs.lock().unwrap().push(summary.clone());
    }
}

#[derive(Default)]
struct FakeProcess {
    running: AtomicBool,
    fail_stop: AtomicBool,
    fail_restart: AtomicBool,
    stops: AtomicUsize,
    restarts: AtomicUsize,
}

impl ProcessControl for FakeProcess {
    fn is_running(&self, _project_id: &str) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    fn stop(&self, _project_id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(AgentError::Process("stop command exited with 1".into()));
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn restart(&self, _project_id: &str) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(AgentError::Process("restart command exited with 1".into()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    root: PathBuf,
    service: FileMutationService,
    notifier: Arc<RecordingNotifier>,
    process: Arc<FakeProcess>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("lib");
        fs::create_dir_all(root.join("conf")).unwrap();

        let mut config = Config::default();
        config.agent.data_dir = dir.path().join("data");
        config.projects.insert(
            "web".to_string(),
            ProjectConfig {
                path: root.clone(),
                ..Default::default()
            },
        );

        let notifier = Arc::new(RecordingNotifier::default());
        let process = Arc::new(FakeProcess::default());
        let service = FileMutationService::new(Arc::new(config), notifier.clone(), process.clone());

        Self {
            dir,
            root,
            service,
            notifier,
            process,
        }
    }

    fn backups_dir(&self) -> PathBuf {
        self.dir.path().join("data/backups/web")
    }

    fn retained_backups(&self) -> usize {
        fs::read_dir(self.backups_dir()).map(|d| d.count()).unwrap_or(0)
    }

    fn events(&self) -> Vec<FileChangeEvent> {
        self.notifier.changes.lock().unwrap().clone()
    }

    fn diffs(&self) -> Vec<ChangeSummary> {
        self.notifier.diffs.lock().unwrap().clone()
    }
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn options(dest: &str) -> UploadOptions {
    UploadOptions {
        dest_subdir: dest.to_string(),
        ..Default::default()
    }
}

fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_chunked_upload_end_to_end() -> Result<()> {
    let f = Fixture::new();
    let content: Vec<u8> = (0..300u32).map(|i| b'a' + (i % 26) as u8).collect();

    // Out of order, with a duplicate
    for index in [2u32, 0, 1, 0] {
        let start = index as usize * 100;
        f.service
            .put_chunk("web", "slice-1", index, 3, "app.conf", &content[start..start + 100])
            .await?;
    }

    let request = MergeRequest {
        slice_id: "slice-1".to_string(),
        total_slice: 3,
        checksum: md5_hex(&content),
        options: options("conf"),
    };
    let report = f.service.merge_chunks("web", &request).await?;
    assert_eq!(report.bytes, Some(300));

    let text = f.service.read_text_file("web", "conf", "app.conf").await?;
    assert_eq!(text.as_bytes(), &content[..]);

    let changes = report.changes.unwrap();
    assert_eq!(changes.added, vec!["conf/app.conf"]);
    assert_eq!(f.diffs(), vec![changes]);
    let events = f.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Merge);
    assert_eq!(events[0].file_name.as_deref(), Some("app.conf"));
    assert_eq!(f.service.open_backups(), 0);
    Ok(())
}

#[tokio::test]
async fn test_diff_files_scenario() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("a.txt"), b"server a")?;
    fs::write(f.root.join("b.txt"), b"server b")?;
    fs::remove_dir(f.root.join("conf"))?;

    let client = vec![FileManifestEntry::new("a.txt", "D1")];
    let result = f.service.diff_files("web", "/", &client).await?;

    assert_eq!(result.to_sync, vec![FileManifestEntry::new("a.txt", "D1")]);
    assert_eq!(result.to_delete, vec![FileManifestEntry::new("b.txt", hash_bytes(b"server b"))]);
    Ok(())
}

#[tokio::test]
async fn test_incomplete_merge_opens_no_backup() -> Result<()> {
    let f = Fixture::new();
    f.service.put_chunk("web", "s", 0, 2, "big.bin", b"half").await?;

    let request = MergeRequest {
        slice_id: "s".to_string(),
        total_slice: 2,
        checksum: md5_hex(b"halfhalf"),
        options: options(""),
    };
    let err = f.service.merge_chunks("web", &request).await.unwrap_err();
    assert!(matches!(err, AgentError::Incomplete { received: 1, expected: 2 }));
    assert!(err.retryable());
    assert_eq!(f.retained_backups(), 0);
    assert!(f.events().is_empty());

    f.service.put_chunk("web", "s", 1, 2, "big.bin", b"half").await?;
    f.service.merge_chunks("web", &request).await?;
    assert_eq!(fs::read(f.root.join("big.bin"))?, b"halfhalf");
    Ok(())
}

#[tokio::test]
async fn test_upload_extract_with_clear() -> Result<()> {
    let f = Fixture::new();
    fs::create_dir_all(f.root.join("www"))?;
    fs::write(f.root.join("www/old.html"), b"old")?;

    let upload = UploadOptions {
        dest_subdir: "www".to_string(),
        extract: true,
        strip_components: 1,
        clear: true,
        ..Default::default()
    };
    let archive = tar_gz(&[("site/index.html", b"<html/>"), ("site/js/app.js", b"js")]);
    let report = f.service.upload_file("web", "site.tar.gz", &archive, &upload).await?;

    assert_eq!(fs::read(f.root.join("www/index.html"))?, b"<html/>");
    assert_eq!(fs::read(f.root.join("www/js/app.js"))?, b"js");
    assert!(!f.root.join("www/old.html").exists());
    assert!(!f.root.join("www/site.tar.gz").exists());

    let changes = report.changes.unwrap();
    assert_eq!(changes.added, vec!["www/index.html", "www/js/app.js"]);
    assert_eq!(changes.removed, vec!["www/old.html"]);

    // The cleared file is recoverable from the retained backup
    let copy = f.backups_dir().join(&changes.backup_id).join("files/www/old.html");
    assert_eq!(fs::read(copy)?, b"old");
    Ok(())
}

#[tokio::test]
async fn test_failed_extraction_reports_partial_changes() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/app.conf"), b"keep me")?;

    let upload = UploadOptions {
        dest_subdir: "conf".to_string(),
        extract: true,
        clear: true,
        ..Default::default()
    };
    let err = f
        .service
        .upload_file("web", "bundle.zip", b"PK\x03\x04 truncated", &upload)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "EXTRACTION_ERROR");
    let changes = err.partial_changes().expect("files were cleared");
    assert_eq!(changes.removed, vec!["conf/app.conf"]);
    assert_eq!(f.diffs().len(), 1);
    assert!(f.events().is_empty());
    assert_eq!(f.service.open_backups(), 0);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_archive_rejected_before_backup() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/app.conf"), b"keep me")?;

    let upload = UploadOptions {
        dest_subdir: "conf".to_string(),
        extract: true,
        clear: true,
        ..Default::default()
    };
    let err = f
        .service
        .upload_file("web", "notes.rar", b"Rar!\x1a\x07", &upload)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::UnsupportedFormat(_)));
    assert!(f.root.join("conf/app.conf").exists());
    assert_eq!(f.retained_backups(), 0);
    assert!(f.diffs().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_close_first_stops_running_process() -> Result<()> {
    let f = Fixture::new();
    f.process.running.store(true, Ordering::SeqCst);

    let upload = UploadOptions {
        close_first: true,
        after_action: AfterAction::RestartIfRunning,
        ..Default::default()
    };
    let report = f.service.upload_file("web", "app.jar", b"jar", &upload).await?;

    assert_eq!(f.process.stops.load(Ordering::SeqCst), 1);
    // Stopped first, so the conditional restart is skipped
    let after = report.after_action.unwrap();
    assert!(!after.performed);
    assert_eq!(f.process.restarts.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_stop_is_precondition_failure() -> Result<()> {
    let f = Fixture::new();
    f.process.running.store(true, Ordering::SeqCst);
    f.process.fail_stop.store(true, Ordering::SeqCst);

    let upload = UploadOptions {
        close_first: true,
        ..Default::default()
    };
    let err = f.service.upload_file("web", "app.jar", b"jar", &upload).await.unwrap_err();

    assert!(matches!(err, AgentError::PreconditionFailed(_)));
    assert!(!f.root.join("app.jar").exists());
    assert_eq!(f.retained_backups(), 0);
    Ok(())
}

#[tokio::test]
async fn test_after_actions() -> Result<()> {
    let f = Fixture::new();
    f.process.fail_restart.store(true, Ordering::SeqCst);

    let restart = UploadOptions {
        after_action: AfterAction::Restart,
        ..Default::default()
    };
    let report = f.service.upload_file("web", "a.jar", b"1", &restart).await?;
    let after = report.after_action.unwrap();
    assert!(after.performed);
    assert!(!after.success);
    assert!(after.message.is_some());

    let must = UploadOptions {
        after_action: AfterAction::MustRestart,
        ..Default::default()
    };
    let err = f.service.upload_file("web", "b.jar", b"2", &must).await.unwrap_err();
    assert_eq!(err.code(), "PROCESS_ERROR");
    assert_eq!(err.partial_changes().unwrap().added, vec!["b.jar"]);

    f.process.fail_restart.store(false, Ordering::SeqCst);
    let report = f.service.upload_file("web", "c.jar", b"3", &must).await?;
    assert!(report.after_action.unwrap().success);
    assert_eq!(f.process.restarts.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_delete_operations() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/a.conf"), b"a")?;
    fs::write(f.root.join("conf/b.conf"), b"b")?;
    fs::create_dir_all(f.root.join("logs/2024"))?;
    fs::write(f.root.join("logs/2024/x.log"), b"x")?;

    assert!(matches!(
        f.service.delete_file("web", "conf", Some("missing.conf")).await,
        Err(AgentError::NotFound(_))
    ));
    assert!(matches!(
        f.service.delete_file("web", "/", None).await,
        Err(AgentError::InvalidArgument(_))
    ));

    let report = f.service.delete_file("web", "conf", Some("a.conf")).await?;
    assert_eq!(report.changes.unwrap().removed, vec!["conf/a.conf"]);

    f.service.delete_all("web", "logs").await?;
    assert!(f.root.join("logs").is_dir());
    assert_eq!(fs::read_dir(f.root.join("logs"))?.count(), 0);
    assert!(matches!(f.service.delete_all("web", "nope").await, Err(AgentError::NotFound(_))));

    let names = vec!["b.conf".to_string(), "ghost.conf".to_string()];
    let report = f.service.batch_delete("web", "conf", &names).await?;
    assert_eq!(report.detail, "deleted 1 of 2 entries");
    assert!(!f.root.join("conf/b.conf").exists());
    assert!(matches!(
        f.service.batch_delete("web", "conf", &[]).await,
        Err(AgentError::InvalidArgument(_))
    ));

    f.service.delete_file("web", "conf", None).await?;
    assert!(!f.root.join("conf").exists());
    Ok(())
}

#[test]
fn test_delete_failure_while_running() {
    let process = FakeProcess::default();
    let err = delete_failure(&process, "web", Path::new("/x"), io::Error::other("busy"));
    assert!(matches!(err, AgentError::Io(_)));

    process.running.store(true, Ordering::SeqCst);
    let err = delete_failure(&process, "web", Path::new("/x"), io::Error::other("busy"));
    assert!(matches!(err, AgentError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_rename_and_create() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/app.conf"), b"x")?;
    fs::write(f.root.join("conf/taken.conf"), b"y")?;

    assert!(matches!(
        f.service.rename_file("web", "conf", "nope.conf", "new.conf").await,
        Err(AgentError::NotFound(_))
    ));
    assert!(matches!(
        f.service.rename_file("web", "conf", "app.conf", "taken.conf").await,
        Err(AgentError::AlreadyExists(_))
    ));
    assert!(matches!(
        f.service.rename_file("web", "conf", "app.conf", "../escape.conf").await,
        Err(AgentError::InvalidPath(_))
    ));

    let report = f.service.rename_file("web", "conf", "app.conf", "app.conf.bak").await?;
    let changes = report.changes.unwrap();
    assert_eq!(changes.added, vec!["conf/app.conf.bak"]);
    assert_eq!(changes.removed, vec!["conf/app.conf"]);

    f.service.create_entry("web", "conf", "extra.d", true).await?;
    assert!(f.root.join("conf/extra.d").is_dir());
    f.service.create_entry("web", "conf/extra.d", "empty.conf", false).await?;
    assert_eq!(fs::read(f.root.join("conf/extra.d/empty.conf"))?, b"");
    assert!(matches!(
        f.service.create_entry("web", "conf", "extra.d", false).await,
        Err(AgentError::AlreadyExists(_))
    ));
    // Entry names carry no path structure
    assert!(matches!(
        f.service.create_entry("web", "conf", "nested/new.conf", false).await,
        Err(AgentError::InvalidPath(_))
    ));
    assert!(matches!(
        f.service.rename_file("web", "conf", "taken.conf", "extra.d/taken.conf").await,
        Err(AgentError::InvalidPath(_))
    ));
    assert!(!f.root.join("conf/nested").exists());
    Ok(())
}

#[tokio::test]
async fn test_batch_delete_accepts_diff_paths() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/stale.yml"), b"old")?;
    fs::write(f.root.join("keep.txt"), b"keep")?;

    let client = vec![FileManifestEntry::new("keep.txt", hash_bytes(b"keep"))];
    let diff = f.service.diff_files("web", "/", &client).await?;
    let stale: Vec<String> = diff.to_delete.into_iter().map(|e| e.name).collect();
    assert_eq!(stale, vec!["conf/stale.yml"]);

    let report = f.service.batch_delete("web", "/", &stale).await?;
    assert!(!f.root.join("conf/stale.yml").exists());
    assert!(f.root.join("keep.txt").exists());
    assert_eq!(report.changes.unwrap().removed, vec!["conf/stale.yml"]);

    // Names stay strictly inside `dir`
    for bad in ["../keep.txt", "a/../../keep.txt", "/", "."] {
        let err = f.service.batch_delete("web", "conf", &[bad.to_string()]).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidPath(_)), "{}: {:?}", bad, err);
    }
    assert!(f.root.join("keep.txt").exists());
    assert!(f.root.join("conf").is_dir());
    Ok(())
}

#[tokio::test]
async fn test_text_files_and_listing() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("app.jar"), b"\x00\x01")?;

    assert!(matches!(
        f.service.read_text_file("web", "/", "app.jar").await,
        Err(AgentError::NotEditable(_))
    ));
    assert!(matches!(
        f.service.write_text_file("web", "/", "app.jar", "x".into()).await,
        Err(AgentError::NotEditable(_))
    ));
    assert!(matches!(
        f.service.read_text_file("web", "conf", "missing.yml").await,
        Err(AgentError::NotFound(_))
    ));

    f.service.write_text_file("web", "conf", "app.yml", "port: 80\n".into()).await?;
    assert_eq!(f.service.read_text_file("web", "conf", "app.yml").await?, "port: 80\n");
    assert!(matches!(
        f.service.write_text_file("web", "nodir", "x.yml", "".into()).await,
        Err(AgentError::NotFound(_))
    ));

    let listing = f.service.list_files("web", "/").await?;
    let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["conf", "app.jar"]);
    assert!(listing[0].is_dir && !listing[0].editable);
    assert!(!listing[1].editable);
    assert_eq!(listing[1].size, 2);

    let conf = f.service.list_files("web", "conf").await?;
    assert!(conf[0].editable);
    assert!(f.service.list_files("web", "missing").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_download_file() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/app.conf"), b"port=1")?;

    let target = f.service.download_file("web", "conf", "app.conf").await?;
    assert_eq!(target.size, 6);
    assert_eq!(target.path, f.root.join("conf/app.conf"));

    assert!(matches!(
        f.service.download_file("web", "/", "conf").await,
        Err(AgentError::InvalidArgument(_))
    ));
    assert!(matches!(
        f.service.download_file("web", "conf", "none").await,
        Err(AgentError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_traversal_and_unknown_project_rejected() {
    let f = Fixture::new();
    assert!(matches!(
        f.service.list_files("web", "../../etc").await,
        Err(AgentError::InvalidPath(_))
    ));
    assert!(matches!(
        f.service.upload_file("web", "passwd", b"x", &options("../../etc")).await,
        Err(AgentError::InvalidPath(_))
    ));
    assert!(matches!(
        f.service.list_files("other", "/").await,
        Err(AgentError::NotFound(_))
    ));
    assert_eq!(f.retained_backups(), 0);
}

#[tokio::test]
async fn test_restore_backup() -> Result<()> {
    let f = Fixture::new();
    fs::write(f.root.join("conf/app.conf"), b"good")?;

    let report = f
        .service
        .write_text_file("web", "conf", "app.conf", "broken".into())
        .await?;
    let backup_id = report.changes.unwrap().backup_id;

    let restored = f.service.restore_backup("web", &backup_id).await?;
    assert_eq!(fs::read(f.root.join("conf/app.conf"))?, b"good");
    assert_eq!(restored.changes.unwrap().modified, vec!["conf/app.conf"]);
    assert_eq!(f.events().last().unwrap().kind, ChangeKind::Restore);

    assert!(matches!(
        f.service.restore_backup("web", "no-such-backup").await,
        Err(AgentError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_mutations_do_not_interleave() -> Result<()> {
    let f = Fixture::new();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let service = f.service.clone();
        tasks.push(tokio::spawn(async move {
            let name = format!("file-{}.txt", i);
            service
                .upload_file("web", &name, name.as_bytes(), &UploadOptions::default())
                .await
        }));
    }

    for task in tasks {
        let changes = task.await.unwrap()?.changes.unwrap();
        // Each backup window saw exactly its own upload
        assert_eq!(changes.added.len(), 1);
        assert!(changes.modified.is_empty() && changes.removed.is_empty());
    }
    Ok(())
}

#[test]
fn test_editable_suffixes() {
    let f = Fixture::new();
    assert!(f.service.is_editable("app.CONF"));
    assert!(f.service.is_editable("settings.yml"));
    assert!(!f.service.is_editable("app.jar"));
    assert!(!f.service.is_editable("conf"));
}

#[test]
fn test_merge_request_wire_names() {
    let request: MergeRequest = serde_json::from_str(
        r#"{"sliceId":"s1","totalSlice":3,"fileSumMd5":"abc","destSubdir":"lib","extract":true,"stripComponents":1,"afterAction":2}"#,
    )
    .unwrap();
    assert_eq!(request.checksum, "abc");
    assert_eq!(request.options.dest_subdir, "lib");
    assert!(request.options.extract);
    assert_eq!(request.options.after_action, AfterAction::RestartIfRunning);
    assert!(!request.options.clear);
}

#[tokio::test]
async fn test_unsupported_chunked_archive_keeps_chunks() -> Result<()> {
    let f = Fixture::new();
    let text = vec![b'x'; 600];
    f.service.put_chunk("web", "notes", 0, 2, "notes.txt", &text[..300]).await?;
    f.service.put_chunk("web", "notes", 1, 2, "notes.txt", &text[300..]).await?;

    let request = MergeRequest {
        slice_id: "notes".to_string(),
        total_slice: 2,
        checksum: md5_hex(&text),
        options: UploadOptions {
            extract: true,
            ..options("conf")
        },
    };
    let err = f.service.merge_chunks("web", &request).await.unwrap_err();
    assert!(matches!(err, AgentError::UnsupportedFormat(_)));

    // Chunks survive, so a plain merge can still follow
    let session = f.dir.path().join("data/slices/notes");
    assert!(session.join("0.part").exists());
    assert!(session.join("1.part").exists());
    assert_eq!(f.retained_backups(), 0);

    let plain = MergeRequest {
        options: options("conf"),
        ..request
    };
    f.service.merge_chunks("web", &plain).await?;
    assert_eq!(fs::read(f.root.join("conf/notes.txt"))?, text);
    Ok(())
}

#[test]
fn test_move_file_places_content() -> Result<()> {
    let dir = TempDir::new()?;
    let source = dir.path().join("staged.bin");
    let target = dir.path().join("placed.bin");
    fs::write(&source, b"payload")?;

    assert_eq!(move_file(&source, &target)?, 7);
    assert!(!source.exists());
    assert_eq!(fs::read(&target)?, b"payload");
    Ok(())
}

async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn remote(url: String, dir: &str) -> RemoteFetchRequest {
    RemoteFetchRequest {
        url,
        dir: dir.to_string(),
        extract: false,
        strip_components: 0,
        timeout_secs: None,
    }
}

#[tokio::test]
async fn test_fetch_remote_places_file() -> Result<()> {
    use axum::routing::get;

    let archive = tar_gz(&[("release/bin/app", b"binary"), ("release/app.conf", b"port=1")]);
    let router = axum::Router::new()
        .route("/rel/app.conf", get(|| async { "port=9090" }))
        .route(
            "/rel/release.tar.gz",
            get(move || {
                let body = archive.clone();
                async move { body }
            }),
        );
    let base = serve(router).await;
    let f = Fixture::new();

    let url = format!("{}/rel/app.conf", base);
    let report = f.service.fetch_remote_and_store("web", &remote(url.clone(), "conf")).await?;
    assert_eq!(fs::read(f.root.join("conf/app.conf"))?, b"port=9090");
    assert_eq!(report.changes.unwrap().added, vec!["conf/app.conf"]);

    let events = f.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Remote);
    assert_eq!(events[0].file_name.as_deref(), Some("app.conf"));
    assert_eq!(events[0].url.as_deref(), Some(url.as_str()));
    assert_eq!(f.service.open_backups(), 0);

    let request = RemoteFetchRequest {
        extract: true,
        strip_components: 1,
        ..remote(format!("{}/rel/release.tar.gz", base), "app")
    };
    let report = f.service.fetch_remote_and_store("web", &request).await?;
    assert_eq!(fs::read(f.root.join("app/bin/app"))?, b"binary");
    assert_eq!(fs::read(f.root.join("app/app.conf"))?, b"port=1");
    assert!(!f.root.join("app/release.tar.gz").exists());
    assert_eq!(report.changes.unwrap().added, vec!["app/app.conf", "app/bin/app"]);
    assert_eq!(f.diffs().len(), 2);
    assert_eq!(f.service.open_backups(), 0);
    Ok(())
}

#[tokio::test]
async fn test_fetch_remote_timeout_is_retryable() -> Result<()> {
    use axum::routing::get;

    let router = axum::Router::new().route(
        "/slow.bin",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }),
    );
    let base = serve(router).await;
    let f = Fixture::new();

    let request = RemoteFetchRequest {
        timeout_secs: Some(1),
        ..remote(format!("{}/slow.bin", base), "conf")
    };
    let err = f.service.fetch_remote_and_store("web", &request).await.unwrap_err();

    assert!(matches!(err, AgentError::Download { retryable: true, .. }));
    assert!(!f.root.join("conf/slow.bin").exists());
    assert!(f.events().is_empty());
    assert!(f.diffs().is_empty());
    assert_eq!(f.service.open_backups(), 0);
    assert_eq!(f.retained_backups(), 0);
    Ok(())
}
