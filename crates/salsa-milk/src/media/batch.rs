//! Batch vocal isolation: normalize, separate, remux
//!
//! Each input file runs through three external tools in order. A failure in
//! any of them is logged and reported as an `error` progress event for that
//! file only; the batch always moves on to the next file. Intermediates for a
//! file are removed whatever the outcome.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::progress::{
    demucs_fraction, FileWindow, PercentParser, ProgressCallback, ProgressEvent,
    ProgressLineParser, Stage, DEMUCS_END, DEMUCS_START,
};
use super::tools::{PipelineTools, ToolRunner};

/// Extensions treated as video containers
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

/// Audio extensions kept as-is for the output
pub const AUDIO_OUTPUT_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "aac", "opus"];

/// Stem written by the separation tool
pub const VOCALS_STEM: &str = "vocals.wav";

/// Input media kind, decided by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn of(path: &Path) -> Self {
        if VIDEO_EXTENSIONS.contains(&lowercase_ext(path).as_str()) {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

fn lowercase_ext(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Output extension and audio codec for an audio input
pub fn audio_output_format(input: &Path) -> (String, &'static str) {
    let original = lowercase_ext(input);
    let ext = if AUDIO_OUTPUT_EXTENSIONS.contains(&original.as_str()) {
        original
    } else {
        "wav".to_string()
    };

    let codec = match ext.as_str() {
        "mp3" => "libmp3lame",
        "aac" | "m4a" => "aac",
        "ogg" | "opus" => "libopus",
        _ => "copy",
    };
    (ext, codec)
}

/// One batch run
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    /// Existing input files, processed in order
    pub files: Vec<PathBuf>,
    /// Separation model name
    pub model: String,
    /// Root for intermediates owned by this run
    pub temp_dir: PathBuf,
    /// Root for final outputs
    pub output_dir: PathBuf,
}

/// A successfully processed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub input: PathBuf,
    pub output: PathBuf,
    pub id: String,
}

/// Anything that can turn a request into results; the web layer depends on this
pub trait MediaProcessor: Send + Sync {
    fn process(
        &self,
        request: &ProcessingRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<ProcessingResult>>;
}

/// Runs the external-tool pipeline over a batch of files
pub struct BatchProcessor {
    runner: Arc<dyn ToolRunner>,
    tools: PipelineTools,
    parser: Arc<dyn ProgressLineParser>,
}

/// Per-run scratch layout
struct RunDirs {
    audio: PathBuf,
    demucs: PathBuf,
    output: PathBuf,
}

/// Emits events inside one file's window
struct FileReporter<'a> {
    callback: Option<&'a ProgressCallback>,
    window: FileWindow,
}

impl FileReporter<'_> {
    fn emit(&self, stage: Stage, local: f64, message: String) {
        if let Some(callback) = self.callback {
            callback(ProgressEvent::new(stage, self.window.fraction(local), Some(message)));
        }
    }
}

impl BatchProcessor {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: PipelineTools) -> Self {
        Self {
            runner,
            tools,
            parser: Arc::new(PercentParser),
        }
    }

    /// Replace the separation-output progress parser
    pub fn with_parser(mut self, parser: Arc<dyn ProgressLineParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Process every file in `request`.
    ///
    /// With `show_progress_bar`, more than one file and no callback, a
    /// terminal progress bar tracks files.
    pub fn process_batch(
        &self,
        request: &ProcessingRequest,
        progress: Option<ProgressCallback>,
        show_progress_bar: bool,
    ) -> Result<Vec<ProcessingResult>> {
        if request.files.is_empty() {
            return Ok(Vec::new());
        }

        let dirs = RunDirs {
            audio: request.temp_dir.join("audio"),
            demucs: request.temp_dir.join("demucs"),
            output: request.output_dir.clone(),
        };
        fs::create_dir_all(&dirs.audio)?;
        fs::create_dir_all(&dirs.demucs)?;
        fs::create_dir_all(&dirs.output)?;

        let total = request.files.len();
        let bar = (show_progress_bar && total > 1 && progress.is_none()).then(|| {
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::with_template("{msg} {bar:40} {pos}/{len} [{elapsed_precise}]") {
                bar.set_style(style);
            }
            bar.set_message("Processing files");
            bar
        });

        let mut results = Vec::new();

        for (index, file) in request.files.iter().enumerate() {
            let reporter = FileReporter {
                callback: progress.as_ref(),
                window: FileWindow::new(index, total),
            };
            let file_id = file_id(file);
            let file_name = file_name(file);
            tracing::info!("Processing {}", file_name);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.process_file(&dirs, &request.model, file, &file_id, &file_name, &reporter)
            }));

            match outcome {
                Ok(Ok(Some(result))) => {
                    results.push(result);
                    reporter.emit(Stage::FileComplete, 1.0, format!("Finished {}", file_name));
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) if e.is_tool_failure() => {
                    tracing::error!("Processing failed for {}: {}", file_id, e);
                    reporter.emit(
                        Stage::Error,
                        reporter.window.span,
                        format!("Processing failed for {}", file_name),
                    );
                }
                Ok(Err(e)) => {
                    tracing::error!("Processing failed for {} (unexpected error): {:?}", file_id, e);
                    reporter.emit(
                        Stage::Error,
                        reporter.window.span,
                        format!("Processing failed for {}", file_name),
                    );
                }
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!("Processing failed for {} (panic): {}", file_id, detail);
                    reporter.emit(
                        Stage::Error,
                        reporter.window.span,
                        format!("Processing failed for {}", file_name),
                    );
                }
            }

            cleanup_file(&dirs, &request.model, &file_id);

            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        if let Some(callback) = &progress {
            callback(ProgressEvent::new(
                Stage::Complete,
                1.0,
                Some("All files processed.".to_string()),
            ));
        }

        Ok(results)
    }

    /// Run the three stages for one file. `Ok(None)` means the separated
    /// vocals never appeared and the file was skipped.
    fn process_file(
        &self,
        dirs: &RunDirs,
        model: &str,
        file: &Path,
        file_id: &str,
        file_name: &str,
        reporter: &FileReporter<'_>,
    ) -> Result<Option<ProcessingResult>> {
        if !file.is_file() {
            return Err(Error::MissingInput(file.to_path_buf()));
        }
        let wav_path = dirs.audio.join(format!("{}.wav", file_id));

        reporter.emit(Stage::Prepare, 0.02, format!("Preparing {}", file_name));
        tracing::info!("Converting {} to WAV", file_name);
        self.runner.run(&self.tools.normalize(file, &wav_path))?;
        reporter.emit(Stage::Convert, 0.18, format!("Converted {} to WAV", file_name));

        tracing::info!("Running Demucs ({}) on {}", model, file_name);
        reporter.emit(Stage::Demucs, DEMUCS_START, format!("Starting Demucs for {}", file_name));
        let parser = &self.parser;
        let mut on_line = |raw: &str| {
            let line = raw.trim();
            if !line.is_empty() {
                tracing::info!("demucs: {}", line);
            }
            if let Some(percent) = parser.parse(raw) {
                reporter.emit(
                    Stage::Demucs,
                    demucs_fraction(percent),
                    format!("Demucs {}% for {}", percent, file_name),
                );
            }
        };
        self.runner
            .stream_stderr(&self.tools.separate(model, &dirs.demucs, &wav_path), &mut on_line)?;
        reporter.emit(Stage::Demucs, DEMUCS_END, format!("Demucs complete for {}", file_name));

        let Some(vocals_path) = locate_vocals(&dirs.demucs, model, file_id) else {
            tracing::warn!("Could not find extracted vocals for {}", file_id);
            return Ok(None);
        };

        let (output_path, command) = match MediaKind::of(file) {
            MediaKind::Video => {
                let output = dirs.output.join(format!("{}_vocals.mp4", file_id));
                let command = self.tools.remux_video(file, &vocals_path, &output);
                (output, command)
            }
            MediaKind::Audio => {
                let (ext, codec) = audio_output_format(file);
                let output = dirs.output.join(format!("{}_vocals.{}", file_id, ext));
                let command = self.tools.remux_audio(&vocals_path, codec, &output);
                (output, command)
            }
        };

        tracing::info!("Writing final output to {}", output_path.display());
        self.runner.run(&command)?;
        reporter.emit(Stage::Mux, 0.95, format!("Writing output for {}", file_name));

        if !output_path.exists() {
            return Err(Error::MissingOutput(output_path));
        }

        Ok(Some(ProcessingResult {
            input: file.to_path_buf(),
            output: output_path,
            id: file_id.to_string(),
        }))
    }
}

impl MediaProcessor for BatchProcessor {
    fn process(
        &self,
        request: &ProcessingRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<ProcessingResult>> {
        self.process_batch(request, progress, false)
    }
}

fn file_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Expected `<root>/<model>/<id>/vocals.wav`, else the first
/// `<root>/*/<id>/vocals.wav` in name order.
pub fn locate_vocals(demucs_root: &Path, model: &str, file_id: &str) -> Option<PathBuf> {
    let expected = demucs_root.join(model).join(file_id).join(VOCALS_STEM);
    if expected.exists() {
        return Some(expected);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(demucs_root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path().join(file_id).join(VOCALS_STEM))
        .filter(|path| path.exists())
        .collect();
    candidates.sort();

    let found = candidates.into_iter().next()?;
    tracing::info!("Found vocals at alternate path: {}", found.display());
    Some(found)
}

/// Best-effort removal of one file's intermediates
fn cleanup_file(dirs: &RunDirs, model: &str, file_id: &str) {
    let _ = fs::remove_file(dirs.audio.join(format!("{}.wav", file_id)));

    let _ = fs::remove_dir_all(dirs.demucs.join(model).join(file_id));
    if let Ok(entries) = fs::read_dir(&dirs.demucs) {
        for entry in entries.filter_map(|e| e.ok()) {
            let candidate = entry.path().join(file_id);
            if candidate.join(VOCALS_STEM).exists() {
                let _ = fs::remove_dir_all(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tools::fake::{touch, FakeRunner};
    use crate::media::tools::ToolCommand;
    use parking_lot::Mutex;

    /// ffmpeg writes its last argument; demucs writes the expected vocals
    fn happy_runner(lines: &'static [&'static str]) -> FakeRunner {
        FakeRunner::new()
            .on_run(|cmd| {
                touch(cmd.last_arg().unwrap(), b"media");
                Ok(())
            })
            .on_stream(move |cmd| {
                write_vocals(cmd, None);
                (lines.iter().map(|l| l.to_string()).collect(), Ok(()))
            })
    }

    fn write_vocals(cmd: &ToolCommand, model_dir: Option<&str>) {
        let root = PathBuf::from(cmd.value_of("-o").unwrap());
        let model = model_dir.unwrap_or_else(|| cmd.value_of("-n").unwrap());
        let stem = Path::new(cmd.last_arg().unwrap())
            .file_stem()
            .unwrap()
            .to_string_lossy()
            .to_string();
        touch(root.join(model).join(stem).join(VOCALS_STEM), b"vocals");
    }

    fn request(dir: &Path, files: Vec<PathBuf>) -> ProcessingRequest {
        ProcessingRequest {
            files,
            model: "htdemucs".to_string(),
            temp_dir: dir.join("temp"),
            output_dir: dir.join("output"),
        }
    }

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |event| sink.lock().push(event));
        (callback, events)
    }

    fn media(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        touch(&path, b"data");
        path
    }

    #[test]
    fn test_empty_request_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let processor = BatchProcessor::new(runner.clone(), PipelineTools::default());

        let results = processor.process_batch(&request(dir.path(), vec![]), None, true).unwrap();

        assert!(results.is_empty());
        assert!(runner.calls().is_empty());
        assert!(!dir.path().join("temp").exists());
        assert!(!dir.path().join("output").exists());
    }

    #[test]
    fn test_audio_success() {
        let dir = tempfile::tempdir().unwrap();
        let song = media(dir.path(), "song.mp3");
        let runner = Arc::new(happy_runner(&["10%", "100%"]));
        let processor = BatchProcessor::new(runner.clone(), PipelineTools::default());

        let results = processor.process_batch(&request(dir.path(), vec![song.clone()]), None, false).unwrap();

        let expected = dir.path().join("output").join("song_vocals.mp3");
        assert_eq!(
            results,
            vec![ProcessingResult {
                input: song,
                output: expected.clone(),
                id: "song".to_string(),
            }]
        );
        assert!(expected.exists());

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].value_of("-c:a"), Some("libmp3lame"));

        // Intermediates are gone
        assert!(!dir.path().join("temp/audio/song.wav").exists());
        assert!(!dir.path().join("temp/demucs/htdemucs/song").exists());
    }

    #[test]
    fn test_video_with_alternate_vocals() {
        let dir = tempfile::tempdir().unwrap();
        let clip = media(dir.path(), "clip.mp4");
        let runner = Arc::new(
            FakeRunner::new()
                .on_run(|cmd| {
                    touch(cmd.last_arg().unwrap(), b"video");
                    Ok(())
                })
                .on_stream(|cmd| {
                    write_vocals(cmd, Some("alt"));
                    (vec!["25%".into(), "75%".into(), "100%".into()], Ok(()))
                }),
        );
        let processor = BatchProcessor::new(runner.clone(), PipelineTools::default());

        let results = processor.process_batch(&request(dir.path(), vec![clip]), None, false).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output.extension().unwrap(), "mp4");

        let remux = &runner.calls()[2];
        assert!(remux
            .args
            .iter()
            .any(|a| a.ends_with("demucs/alt/clip/vocals.wav")));
        assert_eq!(remux.value_of("-c:v"), Some("copy"));
        assert!(!dir.path().join("temp/demucs/alt/clip").exists());
    }

    #[test]
    fn test_subprocess_errors_yield_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let broken = media(dir.path(), "broken.wav");
        let runner = Arc::new(
            FakeRunner::new().on_run(|cmd| Err(Error::tool_failed(&cmd.program, Some(1)))),
        );
        let processor = BatchProcessor::new(runner, PipelineTools::default());
        let (callback, events) = recorder();

        let results = processor
            .process_batch(&request(dir.path(), vec![broken]), Some(callback), false)
            .unwrap();

        assert!(results.is_empty());
        let events = events.lock();
        assert!(events.iter().any(|e| e.stage == Stage::Error));
        assert_eq!(events.last().unwrap().stage, Stage::Complete);
    }

    #[test]
    fn test_missing_vocals_skips_entry() {
        let dir = tempfile::tempdir().unwrap();
        let song = media(dir.path(), "song.mp3");
        let runner = Arc::new(FakeRunner::new().on_run(|cmd| {
            touch(cmd.last_arg().unwrap(), b"wav");
            Ok(())
        }));
        let processor = BatchProcessor::new(runner.clone(), PipelineTools::default());

        let results = processor.process_batch(&request(dir.path(), vec![song]), None, false).unwrap();

        assert!(results.is_empty());
        // normalize + separate, no remux
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_codec_selection_per_extension() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            media(dir.path(), "clip.aac"),
            media(dir.path(), "clip2.ogg"),
            media(dir.path(), "take.flac"),
        ];
        let runner = Arc::new(happy_runner(&["50%", "100%"]));
        let processor = BatchProcessor::new(runner.clone(), PipelineTools::default());

        let results = processor.process_batch(&request(dir.path(), files), None, true).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[2].output.file_name().unwrap(), "take_vocals.wav");
        let codecs: Vec<String> = runner
            .calls()
            .iter()
            .filter(|c| c.program == "ffmpeg" && !c.args.contains(&"-vn".to_string()))
            .filter_map(|c| c.value_of("-c:a").map(str::to_string))
            .collect();
        assert_eq!(codecs, vec!["aac", "libopus", "copy"]);
    }

    #[test]
    fn test_failure_does_not_stop_later_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = media(dir.path(), "first.mp3");
        let second = media(dir.path(), "second.mp3");
        let runner = Arc::new(
            FakeRunner::new()
                .on_run(|cmd| {
                    if cmd.args.iter().any(|a| a.ends_with("first.mp3")) {
                        return Err(Error::tool_failed("ffmpeg", Some(1)));
                    }
                    touch(cmd.last_arg().unwrap(), b"media");
                    Ok(())
                })
                .on_stream(|cmd| {
                    write_vocals(cmd, None);
                    (Vec::new(), Ok(()))
                }),
        );
        let processor = BatchProcessor::new(runner, PipelineTools::default());

        let results = processor
            .process_batch(&request(dir.path(), vec![first, second]), None, false)
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "second");
    }

    #[test]
    fn test_separation_failure_and_panics_are_contained() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            media(dir.path(), "exits.mp3"),
            media(dir.path(), "panics.mp3"),
            media(dir.path(), "fine.mp3"),
        ];
        let runner = Arc::new(
            FakeRunner::new()
                .on_run(|cmd| {
                    touch(cmd.last_arg().unwrap(), b"media");
                    Ok(())
                })
                .on_stream(|cmd| {
                    let input = cmd.last_arg().unwrap();
                    if input.ends_with("exits.wav") {
                        return (vec!["40%".into()], Err(Error::tool_failed("demucs", Some(2))));
                    }
                    if input.ends_with("panics.wav") {
                        panic!("separation tool exploded");
                    }
                    write_vocals(cmd, None);
                    (Vec::new(), Ok(()))
                }),
        );
        let processor = BatchProcessor::new(runner, PipelineTools::default());
        let (callback, events) = recorder();

        let results = processor
            .process_batch(&request(dir.path(), files), Some(callback), false)
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "fine");
        let errors = events.lock().iter().filter(|e| e.stage == Stage::Error).count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn test_progress_events_bounded_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![media(dir.path(), "a.mp3"), media(dir.path(), "b.mp3")];
        let runner = Arc::new(happy_runner(&["Loading model", "10%", "60%", "100%"]));
        let processor = BatchProcessor::new(runner, PipelineTools::default());
        let (callback, events) = recorder();

        processor
            .process_batch(&request(dir.path(), files), Some(callback), false)
            .unwrap();

        let events = events.lock();
        assert!(events.iter().all(|e| (0.0..=1.0).contains(&e.fraction)));

        let first_file_demucs: Vec<f64> = events
            .iter()
            .filter(|e| e.stage == Stage::Demucs && e.fraction <= 0.5)
            .map(|e| e.fraction)
            .collect();
        assert!(first_file_demucs.windows(2).all(|w| w[0] <= w[1]));
        assert!(first_file_demucs.iter().all(|f| (0.11 - 1e-9..=0.41 + 1e-9).contains(f)));

        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Complete);
        assert!((last.fraction - 1.0).abs() < 1e-9);
        assert_eq!(
            events.iter().filter(|e| e.stage == Stage::FileComplete).count(),
            2
        );
    }

    #[test]
    fn test_vanished_input_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.mp3");
        let kept = media(dir.path(), "kept.mp3");
        let runner = Arc::new(happy_runner(&["100%"]));
        let processor = BatchProcessor::new(runner.clone(), PipelineTools::default());
        let (callback, events) = recorder();

        let results = processor
            .process_batch(&request(dir.path(), vec![gone, kept]), Some(callback), false)
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "kept");
        assert!(runner.calls().iter().all(|c| !c.args.iter().any(|a| a.ends_with("gone.mp3"))));
        assert_eq!(events.lock().iter().filter(|e| e.stage == Stage::Error).count(), 1);
    }

    #[test]
    fn test_media_kind_and_formats() {
        assert_eq!(MediaKind::of(Path::new("a.MKV")), MediaKind::Video);
        assert_eq!(MediaKind::of(Path::new("a.mp3")), MediaKind::Audio);
        assert_eq!(audio_output_format(Path::new("a.mp3")), ("mp3".to_string(), "libmp3lame"));
        assert_eq!(audio_output_format(Path::new("a.M4A")), ("m4a".to_string(), "aac"));
        assert_eq!(audio_output_format(Path::new("a.opus")), ("opus".to_string(), "libopus"));
        assert_eq!(audio_output_format(Path::new("a.wav")), ("wav".to_string(), "copy"));
        assert_eq!(audio_output_format(Path::new("a.xyz")), ("wav".to_string(), "copy"));
    }
}
