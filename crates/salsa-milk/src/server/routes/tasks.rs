//! Upload, progress and download endpoints

use axum::{
    body::Body,
    extract::{multipart::Field, multipart::MultipartError, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::server::state::{upload_path, AppState};
use crate::tasks::{spawn_task, TaskRegistry, TaskSnapshot, TaskState, TaskStatus};

/// Upload extensions accepted by the form
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "ogg", "m4a", "aac", "opus", "flac", "mp4", "mov", "avi", "mkv", "webm",
];

/// Response from a successful upload
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Reduce an uploaded filename to a safe single path component
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Whether a (sanitised) filename carries an accepted extension
pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn multipart_error(e: MultipartError) -> Error {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge
    } else {
        Error::Internal(format!("Failed to read multipart field: {}", e))
    }
}

/// Upload persisted to its own working directory
struct SavedUpload {
    work_dir: PathBuf,
    path: PathBuf,
}

async fn save_field(field: &mut Field<'_>, path: &std::path::Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Walk the form; the first `file` field is validated and streamed to disk.
async fn read_form(
    state: &AppState,
    multipart: &mut Multipart,
    saved: &mut Option<SavedUpload>,
    model: &mut Option<String>,
) -> Result<()> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" if saved.is_none() => {
                let raw_name = field.file_name().unwrap_or("").to_string();
                if raw_name.is_empty() {
                    return Err(Error::NoFile);
                }

                let filename = secure_filename(&raw_name);
                if filename.is_empty() || !allowed_file(&filename) {
                    return Err(Error::InvalidType(raw_name));
                }

                let work_dir = state.create_work_dir()?;
                let path = upload_path(&work_dir, &filename);
                *saved = Some(SavedUpload {
                    work_dir,
                    path: path.clone(),
                });

                let bytes = save_field(&mut field, &path).await?;
                tracing::info!("Received upload {} ({} bytes)", filename, bytes);
            }
            "model" => {
                *model = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }
    Ok(())
}

/// POST /api/process - Upload a media file and start processing
pub async fn api_process(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut saved = None;
    let mut model = None;

    if let Err(e) = read_form(&state, &mut multipart, &mut saved, &mut model).await {
        if let Some(upload) = saved {
            let _ = tokio::fs::remove_dir_all(&upload.work_dir).await;
        }
        return Err(e);
    }

    let upload = saved.ok_or(Error::NoFile)?;
    let model = model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config().pipeline.default_model.clone());

    let task_id = uuid::Uuid::new_v4().simple().to_string();
    let task = TaskState::new(task_id.clone(), upload.work_dir, upload.path, model);
    tracing::info!("Queued task {} with model {}", task_id, task.model);

    state.registry().insert(task);
    spawn_task(state.registry(), state.processor(), task_id.clone());

    let body = Json(ProcessResponse {
        task_id,
        status: TaskStatus::Queued,
    });
    Ok(([(header::CACHE_CONTROL, "no-store")], body).into_response())
}

/// GET /api/progress/:id - Current task status
pub async fn api_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>> {
    state
        .registry()
        .snapshot(&task_id)
        .map(Json)
        .ok_or(Error::TaskNotFound(task_id))
}

/// Finalizes a task once its download body is dropped
struct FinalizeGuard {
    registry: Arc<TaskRegistry>,
    task_id: String,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.registry.finalize(&self.task_id);
    }
}

/// GET /api/download/:id - Stream the result, then forget the task
pub async fn api_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response> {
    let registry = state.registry();
    let (output, download_name) = registry
        .downloadable(&task_id)
        .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

    let file = tokio::fs::File::open(&output).await?;
    let length = file.metadata().await?.len();
    let content_type = mime_guess::from_path(&output).first_or_octet_stream();

    let guard = FinalizeGuard { registry, task_id };
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _keep = &guard;
        chunk
    });

    tracing::info!("Serving download {}", download_name);

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download_name),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
