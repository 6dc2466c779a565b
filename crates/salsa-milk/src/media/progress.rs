//! Progress reporting for batch runs

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Local fraction at which separation starts
pub const DEMUCS_START: f64 = 0.22;
/// Local fraction at which separation ends
pub const DEMUCS_END: f64 = 0.82;

/// Pipeline stage reported with each event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Convert,
    Demucs,
    Mux,
    FileComplete,
    Error,
    Complete,
}

impl Stage {
    /// Message shown when an event carries none
    pub fn default_message(&self, file_name: &str) -> String {
        match self {
            Stage::Prepare => format!("Preparing {}...", file_name),
            Stage::Convert => format!("Converting {}...", file_name),
            Stage::Demucs => format!("Running Demucs on {}...", file_name),
            Stage::Mux => format!("Writing {}...", file_name),
            Stage::FileComplete => format!("Completed {}.", file_name),
            Stage::Error | Stage::Complete => "Processing...".to_string(),
        }
    }
}

/// One progress update; `fraction` covers the whole run and lies in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub fraction: f64,
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, fraction: f64, message: impl Into<Option<String>>) -> Self {
        Self {
            stage,
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        }
    }
}

/// Receiver of progress events
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// The slice of overall progress owned by one file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileWindow {
    pub start: f64,
    pub span: f64,
}

impl FileWindow {
    /// Window of file `index` in a batch of `total`
    pub fn new(index: usize, total: usize) -> Self {
        let total = total.max(1) as f64;
        Self {
            start: index as f64 / total,
            span: 1.0 / total,
        }
    }

    /// Map a per-file fraction onto the whole run, clamped to [0, 1]
    pub fn fraction(&self, local: f64) -> f64 {
        (self.start + self.span * local).clamp(0.0, 1.0)
    }
}

/// Map a separation percentage into the per-file separation band
pub fn demucs_fraction(percent: u8) -> f64 {
    DEMUCS_START + (DEMUCS_END - DEMUCS_START) * (f64::from(percent.min(100)) / 100.0)
}

/// Extracts a percentage from one line of tool diagnostics
pub trait ProgressLineParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<u8>;
}

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})%").expect("valid percent regex"));

/// Matches the first `NN%` in a line, capped at 100
#[derive(Debug, Default, Clone, Copy)]
pub struct PercentParser;

impl ProgressLineParser for PercentParser {
    fn parse(&self, line: &str) -> Option<u8> {
        let caps = PERCENT_RE.captures(line)?;
        let value: u16 = caps.get(1)?.as_str().parse().ok()?;
        Some(value.min(100) as u8)
    }
}
