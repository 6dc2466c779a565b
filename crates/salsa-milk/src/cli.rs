//! Command-line workflow: classify, download, process, report

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::media::{
    classify_inputs, BatchProcessor, Fetcher, PipelineTools, ProcessingRequest, ProcessingResult,
    ToolRunner,
};

/// Extract vocals from media files or YouTube URLs using Demucs.
#[derive(Parser, Debug, Clone)]
#[command(name = "salsa-milk", author, version, about)]
pub struct Cli {
    /// Input media files or YouTube URLs
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Demucs model to use
    #[arg(short, long, default_value = "htdemucs")]
    pub model: String,

    /// Temporary working directory
    #[arg(long, default_value = "/tmp")]
    pub temp_dir: PathBuf,

    /// Directory for processed files
    #[arg(long, default_value = "/output")]
    pub output_dir: PathBuf,

    /// Directory for downloaded YouTube media
    #[arg(long, default_value = "/media")]
    pub download_dir: PathBuf,
}

/// Run the whole workflow; an error means the process should exit 1
pub fn run(cli: &Cli, runner: Arc<dyn ToolRunner>, tools: PipelineTools) -> Result<Vec<ProcessingResult>> {
    for dir in [&cli.output_dir, &cli.download_dir, &cli.temp_dir] {
        std::fs::create_dir_all(dir)?;
    }

    let inputs = classify_inputs(&cli.inputs);
    let downloaded = Fetcher::new(runner.clone(), tools.clone()).download(&inputs.remote, &cli.download_dir);

    let mut files = inputs.local;
    files.extend(downloaded);
    if files.is_empty() {
        return Err(Error::NoValidInputs);
    }

    tracing::info!("Processing {} file(s)...", files.len());
    let request = ProcessingRequest {
        files,
        model: cli.model.clone(),
        temp_dir: cli.temp_dir.clone(),
        output_dir: cli.output_dir.clone(),
    };
    let results = BatchProcessor::new(runner, tools).process_batch(&request, None, true)?;
    if results.is_empty() {
        return Err(Error::NothingProcessed);
    }

    report(&results, &cli.output_dir);
    Ok(results)
}

fn report(results: &[ProcessingResult], output_dir: &Path) {
    tracing::info!("Successfully processed {} file(s):", results.len());
    for (idx, result) in results.iter().enumerate() {
        let name = result
            .output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tracing::info!("{}. {}", idx + 1, name);
    }
    let resolved = output_dir
        .canonicalize()
        .unwrap_or_else(|_| output_dir.to_path_buf());
    tracing::info!("Output files saved to {}", resolved.display());
}
