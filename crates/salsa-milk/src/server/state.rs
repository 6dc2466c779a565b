//! Application state for the upload server

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SalsaConfig;
use crate::error::Result;
use crate::media::{BatchProcessor, MediaProcessor, PipelineTools, SystemRunner};
use crate::tasks::TaskRegistry;

/// Prefix of every task working directory
pub const WORK_DIR_PREFIX: &str = "salsa-milk-";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: SalsaConfig,
    /// Live tasks
    registry: Arc<TaskRegistry>,
    /// Runs uploaded files through the pipeline
    processor: Arc<dyn MediaProcessor>,
}

impl AppState {
    /// State backed by the real external tools
    pub fn new(config: SalsaConfig) -> Self {
        let tools = PipelineTools::from(&config.pipeline);
        tracing::info!(
            "Pipeline tools: demucs={}, ffmpeg={}, yt-dlp={}",
            tools.demucs,
            tools.ffmpeg,
            tools.ytdlp
        );
        let processor = Arc::new(BatchProcessor::new(Arc::new(SystemRunner), tools));
        Self::with_processor(config, processor)
    }

    /// State with an explicit processor
    pub fn with_processor(config: SalsaConfig, processor: Arc<dyn MediaProcessor>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                registry: Arc::new(TaskRegistry::new()),
                processor,
            }),
        }
    }

    pub fn config(&self) -> &SalsaConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.inner.registry.clone()
    }

    pub fn processor(&self) -> Arc<dyn MediaProcessor> {
        self.inner.processor.clone()
    }

    /// Create a fresh, exclusively owned working directory for one task
    pub fn create_work_dir(&self) -> Result<PathBuf> {
        let root = self.config().serving.task_root();
        std::fs::create_dir_all(&root)?;
        let dir = tempfile::Builder::new()
            .prefix(WORK_DIR_PREFIX)
            .keep(true)
            .tempdir_in(&root)?;
        let path = dir.path().to_path_buf();

        for sub in ["uploads", "temp", "output"] {
            std::fs::create_dir_all(path.join(sub))?;
        }
        Ok(path)
    }
}

/// Directory an upload named `filename` is saved to
pub fn upload_path(work_dir: &Path, filename: &str) -> PathBuf {
    work_dir.join("uploads").join(filename)
}
