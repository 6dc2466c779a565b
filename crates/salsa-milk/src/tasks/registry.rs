//! In-memory registry of web processing tasks

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::media::ProgressEvent;

/// Message shown as soon as an upload is accepted
pub const UPLOAD_COMPLETE_MESSAGE: &str = "Upload complete. Preparing to process...";

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Error,
}

/// Everything known about one uploaded file's processing
#[derive(Debug, Clone)]
pub struct TaskState {
    pub id: String,
    /// Owned working directory, removed on finalize
    pub work_dir: PathBuf,
    /// Saved upload
    pub input_path: PathBuf,
    pub model: String,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub status: TaskStatus,
    /// Percentage in [0, 100], never decreasing while running
    pub progress: f64,
    pub message: String,
    pub output_path: Option<PathBuf>,
    pub download_name: Option<String>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskState {
    /// A freshly uploaded task laid out under `work_dir`
    pub fn new(id: impl Into<String>, work_dir: PathBuf, input_path: PathBuf, model: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            temp_dir: work_dir.join("temp"),
            output_dir: work_dir.join("output"),
            work_dir,
            input_path,
            model: model.into(),
            status: TaskStatus::Queued,
            progress: 5.0,
            message: UPLOAD_COMPLETE_MESSAGE.to_string(),
            output_path: None,
            download_name: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn input_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

/// Poll response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub download_ready: bool,
}

impl From<&TaskState> for TaskSnapshot {
    fn from(task: &TaskState) -> Self {
        Self {
            status: task.status,
            progress: (task.progress * 100.0).round() / 100.0,
            message: task.message.clone(),
            error: task.error.clone(),
            download_ready: task.output_path.is_some() && task.status == TaskStatus::Completed,
        }
    }
}

/// Task map behind a single lock. Every method holds it only for a lookup
/// and a few field writes.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: TaskState) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<TaskState> {
        self.tasks.lock().get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.tasks.lock().get(id).map(TaskSnapshot::from)
    }

    /// Record a progress event; unknown ids are ignored
    pub fn apply_progress(&self, id: &str, event: &ProgressEvent) {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(id) else {
            return;
        };

        task.status = TaskStatus::Running;
        task.progress = task.progress.max(event.fraction * 100.0);
        task.message = match &event.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ => event.stage.default_message(&task.input_name()),
        };
        task.touch();
    }

    /// Mark a task completed with its output file
    pub fn complete(&self, id: &str, output: &Path) {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(id) else {
            return;
        };

        let stem = task
            .input_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let suffix = output
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        task.status = TaskStatus::Completed;
        task.progress = 100.0;
        task.message = "Demucs separation complete! Preparing download...".to_string();
        task.download_name = Some(format!("{}_vocals{}", stem, suffix));
        task.output_path = Some(output.to_path_buf());
        task.touch();
    }

    /// Mark a task failed
    pub fn fail(&self, id: &str, message: impl Into<String>, error: impl Into<String>) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get_mut(id) {
            task.status = TaskStatus::Error;
            task.message = message.into();
            task.error = Some(error.into());
            task.touch();
        }
    }

    /// Output path and download name of a completed task whose file exists
    pub fn downloadable(&self, id: &str) -> Option<(PathBuf, String)> {
        let tasks = self.tasks.lock();
        let task = tasks.get(id)?;
        if task.status != TaskStatus::Completed {
            return None;
        }

        let output = task.output_path.clone()?;
        let name = task.download_name.clone().unwrap_or_else(|| {
            output
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        drop(tasks);

        output.exists().then_some((output, name))
    }

    /// Forget a task and delete its working directory. Idempotent.
    pub fn finalize(&self, id: &str) -> bool {
        let Some(task) = self.tasks.lock().remove(id) else {
            return false;
        };

        if let Err(e) = std::fs::remove_dir_all(&task.work_dir) {
            tracing::debug!("Could not remove {}: {}", task.work_dir.display(), e);
        }
        tracing::info!("Finalized task {}", id);
        true
    }

    /// Finalize completed or failed tasks last updated before `cutoff`.
    /// Returns how many were removed.
    pub fn sweep_finished(&self, cutoff: chrono::DateTime<chrono::Utc>) -> usize {
        let stale: Vec<String> = self
            .tasks
            .lock()
            .values()
            .filter(|task| {
                matches!(task.status, TaskStatus::Completed | TaskStatus::Error)
                    && task.updated_at < cutoff
            })
            .map(|task| task.id.clone())
            .collect();

        let removed = stale.iter().filter(|id| self.finalize(id)).count();
        if removed > 0 {
            tracing::info!("Swept {} finished task(s) that were never collected", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
