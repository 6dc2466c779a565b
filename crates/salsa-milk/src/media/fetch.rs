//! Remote media fetching through the downloader

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::tools::{PipelineTools, ToolRunner};

/// Extension of every downloaded file
pub const DOWNLOAD_EXT: &str = "mp4";

/// Seconds since the epoch; swapped out in tests
pub type Clock = fn() -> u64;

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Split a whitespace-separated list of targets
pub fn split_targets(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Stable identifier for a remote target.
///
/// Watch URLs and short links yield the video id; anything else gets a
/// timestamp-based id.
pub fn target_id(url: &str, now: u64) -> String {
    let extracted = if let Some((_, rest)) = url.split_once("youtube.com/watch?v=") {
        rest.split('&').next()
    } else if let Some((_, rest)) = url.split_once("youtu.be/") {
        rest.split('?').next()
    } else {
        None
    };

    match extracted {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("yt_{}", now),
    }
}

/// Downloads remote targets one at a time
pub struct Fetcher {
    runner: Arc<dyn ToolRunner>,
    tools: PipelineTools,
    clock: Clock,
}

impl Fetcher {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: PipelineTools) -> Self {
        Self {
            runner,
            tools,
            clock: unix_now,
        }
    }

    /// Replace the clock used for fallback identifiers
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Download every non-blank target into `dest`.
    ///
    /// Returns the files that exist after a successful download. Failures are
    /// logged per target and never abort the loop.
    pub fn download<S: AsRef<str>>(&self, targets: &[S], dest: &Path) -> Vec<PathBuf> {
        if targets.is_empty() {
            return Vec::new();
        }

        if let Err(e) = std::fs::create_dir_all(dest) {
            tracing::error!("Failed to create download directory {}: {}", dest.display(), e);
            return Vec::new();
        }

        let mut downloaded = Vec::new();

        for target in targets {
            let url = target.as_ref().trim();
            if url.is_empty() {
                continue;
            }

            tracing::info!("Downloading from YouTube: {}", url);
            let video_id = target_id(url, (self.clock)());
            let output_path = dest.join(format!("{}.{}", video_id, DOWNLOAD_EXT));

            if let Err(e) = self.runner.run(&self.tools.download(url, &output_path)) {
                tracing::error!("Failed to download {}: {}", url, e);
                continue;
            }

            if output_path.exists() {
                tracing::info!("Downloaded {} to {}", video_id, output_path.display());
                downloaded.push(output_path);
            } else {
                tracing::error!(
                    "Download reported success but file missing: {}",
                    output_path.display()
                );
            }
        }

        downloaded
    }
}
