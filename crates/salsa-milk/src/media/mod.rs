//! Media pipeline: input classification, downloading, separation and remuxing

mod batch;
mod classify;
mod fetch;
mod progress;
mod tools;

pub use batch::{
    audio_output_format, locate_vocals, BatchProcessor, MediaKind, MediaProcessor,
    ProcessingRequest, ProcessingResult, AUDIO_OUTPUT_EXTENSIONS, VIDEO_EXTENSIONS,
};
pub use classify::{classify_inputs, is_remote, InputSet};
pub use fetch::{split_targets, target_id, Clock, Fetcher};
pub use progress::{
    demucs_fraction, FileWindow, PercentParser, ProgressCallback, ProgressEvent,
    ProgressLineParser, Stage,
};
pub use tools::{read_lines, PipelineTools, SystemRunner, ToolCommand, ToolRunner};

#[cfg(test)]
pub(crate) use tools::fake;
