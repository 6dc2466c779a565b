//! Configuration for the pipeline, the HTTP surface and the serving process
//!
//! Values come from defaults, then an optional TOML file, then environment
//! variables. Malformed integers fall back to their defaults with a warning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable naming an optional TOML config file
pub const CONFIG_PATH_ENV: &str = "SALSA_MILK_CONFIG";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SalsaConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// External tool and directory configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Serving process configuration
    #[serde(default)]
    pub serving: ServingConfig,
}

impl SalsaConfig {
    /// Load configuration: defaults, then the TOML file (explicit path or
    /// `SALSA_MILK_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = int_env_with(&lookup, "PORT", Some(i64::from(self.server.port)), Some(1), false) {
            match u16::try_from(port) {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(
                    "Ignoring out-of-range PORT={}, using {}",
                    port,
                    self.server.port
                ),
            }
        }
        if let Some(max) = int_env_with(
            &lookup,
            "MAX_CONTENT_LENGTH",
            Some(self.server.max_upload_size as i64),
            Some(1),
            false,
        ) {
            self.server.max_upload_size = max as usize;
        }

        if let Some(bin) = lookup("DEMUCS_BIN").filter(|v| !v.trim().is_empty()) {
            self.pipeline.demucs_bin = bin;
        }
        if let Some(bin) = lookup("FFMPEG_BIN").filter(|v| !v.trim().is_empty()) {
            self.pipeline.ffmpeg_bin = bin;
        }
        if let Some(bin) = lookup("YTDLP_BIN").filter(|v| !v.trim().is_empty()) {
            self.pipeline.ytdlp_bin = bin;
        }

        self.serving = ServingConfig::from_lookup(&lookup, &self.serving);
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Maximum upload size in bytes (default: 512MiB)
    pub max_upload_size: usize,
    /// Cookie carrying one-shot messages to the upload page
    pub flash_cookie: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_size: 512 * 1024 * 1024,
            flash_cookie: "salsa_milk_flash".to_string(),
        }
    }
}

/// Pipeline configuration: models, directories and tool executables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Demucs model used when none is requested
    pub default_model: String,
    /// Models offered by the upload form
    pub available_models: Vec<String>,
    /// Scratch directory for intermediates
    pub temp_dir: PathBuf,
    /// Directory for final outputs
    pub output_dir: PathBuf,
    /// Directory for downloaded media
    pub download_dir: PathBuf,
    /// Separation tool executable
    pub demucs_bin: String,
    /// Transcoder executable
    pub ffmpeg_bin: String,
    /// Downloader executable
    pub ytdlp_bin: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_model: "htdemucs".to_string(),
            available_models: vec!["htdemucs".to_string()],
            temp_dir: PathBuf::from("/tmp"),
            output_dir: PathBuf::from("/output"),
            download_dir: PathBuf::from("/media"),
            demucs_bin: "demucs".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ytdlp_bin: "yt-dlp".to_string(),
        }
    }
}

/// Serving process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Worker count (`WEB_CONCURRENCY`)
    pub workers: usize,
    /// Threads per worker (`WEB_THREADS`)
    pub threads: usize,
    /// Request timeout in seconds (`WEB_TIMEOUT`)
    pub timeout_secs: u64,
    /// Shutdown drain deadline in seconds (`WEB_GRACEFUL_TIMEOUT`); unset
    /// follows `timeout_secs`
    pub graceful_timeout_secs: Option<u64>,
    /// Requests served before recycling; `None` is unlimited (`WEB_MAX_REQUESTS`)
    pub max_requests: Option<u64>,
    /// Random extra requests added to `max_requests` (`WEB_MAX_REQUESTS_JITTER`)
    pub max_requests_jitter: u64,
    /// Serving-layer scratch directory (`WORKER_TMP_DIR`), used only when it exists
    pub worker_tmp_dir: Option<PathBuf>,
    /// Parent of per-task working directories (`TASK_DIR`); unset is the system temp dir
    pub task_dir: Option<PathBuf>,
    /// Seconds a finished but uncollected task is kept; `None` keeps it forever (`TASK_TTL`)
    pub task_ttl_secs: Option<u64>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            threads: 1,
            // Demucs jobs are long; keep requests alive for ten minutes.
            timeout_secs: 600,
            graceful_timeout_secs: None,
            max_requests: None,
            max_requests_jitter: 0,
            worker_tmp_dir: None,
            task_dir: None,
            task_ttl_secs: Some(24 * 60 * 60),
        }
    }
}

impl ServingConfig {
    /// Build from a variable lookup, falling back to `base` for anything unset
    pub fn from_lookup<F>(lookup: &F, base: &ServingConfig) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let workers = int_env_with(lookup, "WEB_CONCURRENCY", Some(base.workers as i64), Some(1), false)
            .unwrap_or(1) as usize;
        let threads = int_env_with(lookup, "WEB_THREADS", Some(base.threads as i64), Some(1), false)
            .unwrap_or(1) as usize;
        let timeout_secs = int_env_with(lookup, "WEB_TIMEOUT", Some(base.timeout_secs as i64), Some(1), false)
            .unwrap_or(600) as u64;
        let graceful_timeout_secs = int_env_with(
            lookup,
            "WEB_GRACEFUL_TIMEOUT",
            Some(base.graceful_timeout_secs.unwrap_or(timeout_secs) as i64),
            Some(1),
            false,
        )
        .map(|v| v as u64);

        let max_requests = match int_env_with(
            lookup,
            "WEB_MAX_REQUESTS",
            base.max_requests.map(|v| v as i64),
            None,
            true,
        ) {
            Some(v) if v <= 0 => {
                tracing::warn!("WEB_MAX_REQUESTS={} is not positive, treating as unlimited", v);
                None
            }
            other => other.map(|v| v as u64),
        };
        let max_requests_jitter = int_env_with(
            lookup,
            "WEB_MAX_REQUESTS_JITTER",
            Some(base.max_requests_jitter as i64),
            Some(0),
            false,
        )
        .unwrap_or(0) as u64;

        let worker_tmp_dir = lookup("WORKER_TMP_DIR")
            .map(PathBuf::from)
            .or_else(|| base.worker_tmp_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/dev/shm"));
        let worker_tmp_dir = worker_tmp_dir.is_dir().then_some(worker_tmp_dir);
        let task_ttl_secs = match int_env_with(
            lookup,
            "TASK_TTL",
            base.task_ttl_secs.map(|v| v as i64),
            None,
            true,
        ) {
            Some(v) if v <= 0 => {
                tracing::warn!("TASK_TTL={} is not positive, keeping finished tasks", v);
                None
            }
            other => other.map(|v| v as u64),
        };
        let task_dir = lookup("TASK_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| base.task_dir.clone());

        Self {
            workers,
            threads,
            timeout_secs,
            graceful_timeout_secs,
            max_requests,
            max_requests_jitter,
            worker_tmp_dir,
            task_dir,
            task_ttl_secs,
        }
    }

    /// Total runtime worker threads
    pub fn runtime_threads(&self) -> usize {
        self.workers.max(1) * self.threads.max(1)
    }

    /// Effective shutdown drain deadline
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs.unwrap_or(self.timeout_secs))
    }

    /// How long finished tasks wait to be collected
    pub fn task_ttl(&self) -> Option<Duration> {
        self.task_ttl_secs.map(Duration::from_secs)
    }

    /// Directory under which task working directories are created
    pub fn task_root(&self) -> PathBuf {
        self.task_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Best-effort integer parsing of one environment variable
pub fn int_env(name: &str, default: Option<i64>, minimum: Option<i64>, allow_none: bool) -> Option<i64> {
    int_env_with(&|key: &str| std::env::var(key).ok(), name, default, minimum, allow_none)
}

/// Integer parsing against an arbitrary lookup.
///
/// Unset or blank values yield `default` (blank yields `None` when
/// `allow_none`), `none`/`null` yield `None` when `allow_none`, malformed
/// values yield `default` with a warning, and values below `minimum` are
/// raised to it.
pub fn int_env_with<F>(
    lookup: &F,
    name: &str,
    default: Option<i64>,
    minimum: Option<i64>,
    allow_none: bool,
) -> Option<i64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    let raw = raw.trim();

    if allow_none && matches!(raw.to_lowercase().as_str(), "" | "none" | "null") {
        return None;
    }
    if raw.is_empty() {
        return default;
    }

    let value = match raw.parse::<i64>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}, using default {:?}", name, raw, default);
            return default;
        }
    };

    match minimum {
        Some(min) if value < min => {
            tracing::warn!("{}={} is below the minimum, using {}", name, value, min);
            Some(min)
        }
        _ => Some(value),
    }
}
