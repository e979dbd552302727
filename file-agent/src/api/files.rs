//! Project file endpoints.
//!
//! Thin adapters over [`FileMutationService`]: query strings and JSON bodies
//! in, `{ success, ... }` JSON out. Errors render through
//! [`AgentError`]'s `IntoResponse`.

use super::AppState;
use crate::service::{
    AfterAction, FileEntry, MergeRequest, MutationReport, RemoteFetchRequest, UploadOptions,
};
use crate::sync::{DiffResult, FileManifestEntry, DIGEST_ALGORITHM};
use crate::utils::errors::{AgentError, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

#[derive(Debug, Default, Deserialize)]
pub struct DirQuery {
    #[serde(default)]
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub dir: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: MutationReport,
}

impl From<MutationReport> for MutationResponse {
    fn from(report: MutationReport) -> Self {
        Self { success: true, report }
    }
}

type MutationResult = Result<Json<MutationResponse>>;

/// GET /projects/{id}/files?dir=
pub async fn list(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<DirQuery>,
) -> Result<Json<Vec<FileEntry>>> {
    let entries = state.service.list_files(&project_id, &query.dir).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct DiffRequest {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub files: Vec<FileManifestEntry>,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub algorithm: &'static str,
    #[serde(flatten)]
    pub result: DiffResult,
}

/// POST /projects/{id}/files/diff
pub async fn diff(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<DiffRequest>,
) -> Result<Json<DiffResponse>> {
    let result = state
        .service
        .diff_files(&project_id, &request.dir, &request.files)
        .await?;
    Ok(Json(DiffResponse { algorithm: DIGEST_ALGORITHM, result }))
}

/// Query string of a single-shot upload. Kept flat: urlencoded values
/// cannot pass through `#[serde(flatten)]` as typed fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub file_name: String,
    #[serde(default)]
    pub dest_subdir: String,
    #[serde(default)]
    pub extract: bool,
    #[serde(default)]
    pub strip_components: usize,
    #[serde(default)]
    pub after_action: AfterAction,
    #[serde(default)]
    pub close_first: bool,
    #[serde(default)]
    pub clear: bool,
}

impl UploadQuery {
    fn options(&self) -> UploadOptions {
        UploadOptions {
            dest_subdir: self.dest_subdir.clone(),
            extract: self.extract,
            strip_components: self.strip_components,
            after_action: self.after_action,
            close_first: self.close_first,
            clear: self.clear,
        }
    }
}

/// POST /projects/{id}/files/upload?fileName=...  (raw body)
pub async fn upload(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> MutationResult {
    let report = state
        .service
        .upload_file(&project_id, &query.file_name, &body, &query.options())
        .await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQuery {
    pub slice_id: String,
    pub index: u32,
    pub total_slice: u32,
    pub file_name: String,
}

/// POST /projects/{id}/files/chunks?sliceId&index&totalSlice&fileName  (raw body)
pub async fn put_chunk(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    state
        .service
        .put_chunk(
            &project_id,
            &query.slice_id,
            query.index,
            query.total_slice,
            &query.file_name,
            &body,
        )
        .await?;
    Ok(Json(json!({ "success": true, "index": query.index })))
}

/// POST /projects/{id}/files/merge
pub async fn merge(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<MergeRequest>,
) -> MutationResult {
    let report = state.service.merge_chunks(&project_id, &request).await?;
    Ok(Json(report.into()))
}

/// POST /projects/{id}/files/remote
pub async fn remote(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<RemoteFetchRequest>,
) -> MutationResult {
    let report = state.service.fetch_remote_and_store(&project_id, &request).await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Empty the directory but keep it
    #[serde(default)]
    pub all: bool,
}

/// POST /projects/{id}/files/delete
pub async fn delete(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<DeleteRequest>,
) -> MutationResult {
    let report = if request.all {
        state.service.delete_all(&project_id, &request.dir).await?
    } else {
        state
            .service
            .delete_file(&project_id, &request.dir, request.name.as_deref())
            .await?
    };
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    #[serde(default)]
    pub dir: String,
    pub names: Vec<String>,
}

/// POST /projects/{id}/files/batch-delete
pub async fn batch_delete(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<BatchDeleteRequest>,
) -> MutationResult {
    let report = state
        .service
        .batch_delete(&project_id, &request.dir, &request.names)
        .await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    #[serde(default)]
    pub dir: String,
    pub old_name: String,
    pub new_name: String,
}

/// POST /projects/{id}/files/rename
pub async fn rename(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> MutationResult {
    let report = state
        .service
        .rename_file(&project_id, &request.dir, &request.old_name, &request.new_name)
        .await?;
    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(default)]
    pub dir: String,
    pub name: String,
    #[serde(default)]
    pub is_directory: bool,
}

/// POST /projects/{id}/files/create
pub async fn create(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<CreateRequest>,
) -> MutationResult {
    let report = state
        .service
        .create_entry(&project_id, &request.dir, &request.name, request.is_directory)
        .await?;
    Ok(Json(report.into()))
}

/// GET /projects/{id}/files/text?dir&name
pub async fn read_text(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<impl IntoResponse> {
    let content = state
        .service
        .read_text_file(&project_id, &query.dir, &query.name)
        .await?;
    Ok(Json(json!({ "name": query.name, "content": content })))
}

#[derive(Debug, Deserialize)]
pub struct WriteTextRequest {
    #[serde(default)]
    pub dir: String,
    pub name: String,
    pub content: String,
}

/// PUT /projects/{id}/files/text
pub async fn write_text(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<WriteTextRequest>,
) -> MutationResult {
    let report = state
        .service
        .write_text_file(&project_id, &request.dir, &request.name, request.content)
        .await?;
    Ok(Json(report.into()))
}

/// GET /projects/{id}/files/download?dir&name
pub async fn download(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response> {
    let target = state
        .service
        .download_file(&project_id, &query.dir, &query.name)
        .await?;
    let file = tokio::fs::File::open(&target.path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let disposition = format!(
        "attachment; filename=\"{}\"",
        target.file_name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, target.size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// POST /projects/{id}/backups/{backup_id}/restore
pub async fn restore(
    State(state): State<AppState>,
    Path((project_id, backup_id)): Path<(String, String)>,
) -> MutationResult {
    if backup_id.is_empty() {
        return Err(AgentError::InvalidArgument("backup id is required".into()));
    }
    let report = state.service.restore_backup(&project_id, &backup_id).await?;
    Ok(Json(report.into()))
}
