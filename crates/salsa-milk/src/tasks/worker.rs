//! Background execution of one uploaded task

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::media::{MediaProcessor, ProcessingRequest, ProgressCallback};

use super::registry::TaskRegistry;

/// Longest wait between sweeps of uncollected tasks
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Run the processor for task `id` to completion, recording every outcome in
/// the registry. Blocks the calling thread.
pub fn run_task(registry: Arc<TaskRegistry>, processor: Arc<dyn MediaProcessor>, id: &str) {
    let Some(task) = registry.get(id) else {
        return;
    };

    tracing::info!("Starting task {} ({})", id, task.input_path.display());

    let request = ProcessingRequest {
        files: vec![task.input_path.clone()],
        model: task.model.clone(),
        temp_dir: task.temp_dir.clone(),
        output_dir: task.output_dir.clone(),
    };

    let bridge: ProgressCallback = {
        let registry = registry.clone();
        let id = id.to_string();
        Arc::new(move |event| registry.apply_progress(&id, &event))
    };

    let results = match processor.process(&request, Some(bridge)) {
        Ok(results) => results,
        Err(e) => {
            tracing::error!("Processing failed: {}", e);
            registry.fail(id, "Processing failed. Please try again.", e.to_string());
            return;
        }
    };

    let Some(first) = results.first() else {
        tracing::warn!("Task {} produced no output", id);
        registry.fail(
            id,
            "No output was produced. Please try a different file.",
            "no_output",
        );
        return;
    };

    tracing::info!("Task {} completed: {}", id, first.output.display());
    registry.complete(id, &first.output);
}

/// Hand a task to the blocking pool
pub fn spawn_task(
    registry: Arc<TaskRegistry>,
    processor: Arc<dyn MediaProcessor>,
    id: String,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run_task(registry, processor, &id))
}

/// Periodically finalize finished tasks idle for longer than `ttl`
pub fn spawn_sweeper(registry: Arc<TaskRegistry>, ttl: Duration) -> JoinHandle<()> {
    let max_age = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
    let period = ttl.min(SWEEP_INTERVAL);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            registry.sweep_finished(chrono::Utc::now() - max_age);
        }
    })
}
