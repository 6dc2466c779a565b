//! External tool invocation (demucs, ffmpeg, yt-dlp)
//!
//! Every subprocess the pipeline starts is described by a [`ToolCommand`] and
//! executed through a [`ToolRunner`], so the orchestration logic never touches
//! `std::process` directly.

use std::fmt;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::{Error, Result};

/// Audio bitrate for every lossy encode
pub const AUDIO_BITRATE: &str = "192k";

/// A fully specified external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag`, if present
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Last argument (the output path for ffmpeg, the input for demucs)
    pub fn last_arg(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executable names for the three external tools
#[derive(Debug, Clone)]
pub struct PipelineTools {
    pub demucs: String,
    pub ffmpeg: String,
    pub ytdlp: String,
}

impl Default for PipelineTools {
    fn default() -> Self {
        Self {
            demucs: "demucs".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ytdlp: "yt-dlp".to_string(),
        }
    }
}

impl From<&crate::config::PipelineConfig> for PipelineTools {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            demucs: config.demucs_bin.clone(),
            ffmpeg: config.ffmpeg_bin.clone(),
            ytdlp: config.ytdlp_bin.clone(),
        }
    }
}

impl PipelineTools {
    /// Convert any input to 16-bit 44.1kHz stereo WAV without video
    pub fn normalize(&self, input: &Path, wav: &Path) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .path(input)
            .args(["-vn", "-acodec", "pcm_s16le", "-ar", "44100", "-ac", "2"])
            .path(wav)
    }

    /// Two-stem separation of the normalized WAV
    pub fn separate(&self, model: &str, demucs_root: &Path, wav: &Path) -> ToolCommand {
        ToolCommand::new(&self.demucs)
            .args(["--two-stems", "vocals", "-n", model, "-o"])
            .path(demucs_root)
            .path(wav)
    }

    /// Copy the original video stream and mux in the separated vocals
    pub fn remux_video(&self, original: &Path, vocals: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .path(original)
            .arg("-i")
            .path(vocals)
            .args(["-c:v", "copy", "-c:a", "aac", "-b:a", AUDIO_BITRATE])
            .args(["-map", "0:v:0", "-map", "1:a:0", "-shortest"])
            .path(output)
    }

    /// Re-encode the separated vocals with the given codec
    pub fn remux_audio(&self, vocals: &Path, codec: &str, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .path(vocals)
            .args(["-c:a", codec, "-b:a", AUDIO_BITRATE])
            .path(output)
    }

    /// Fetch the best single-file format of a remote video
    pub fn download(&self, url: &str, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.ytdlp)
            .args(["-f", "b", "--output"])
            .path(output)
            .args(["--no-check-certificate", "--geo-bypass", url])
    }
}

/// Executes external commands
pub trait ToolRunner: Send + Sync {
    /// Run to completion; a non-zero exit is an error
    fn run(&self, command: &ToolCommand) -> Result<()>;

    /// Run while feeding each diagnostic (stderr) line to `on_line`, then wait.
    /// A non-zero exit after the stream closes is an error.
    fn stream_stderr(&self, command: &ToolCommand, on_line: &mut dyn FnMut(&str)) -> Result<()>;
}

/// Runs commands as real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(command: &ToolCommand) -> Command {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).stdin(Stdio::null());
        cmd
    }

    fn spawn_error(command: &ToolCommand, source: std::io::Error) -> Error {
        Error::Spawn {
            program: command.program.clone(),
            source,
        }
    }
}

impl ToolRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<()> {
        tracing::debug!("Running: {}", command);
        let status = Self::command(command)
            .status()
            .map_err(|e| Self::spawn_error(command, e))?;

        if !status.success() {
            return Err(Error::tool_failed(&command.program, status.code()));
        }
        Ok(())
    }

    fn stream_stderr(&self, command: &ToolCommand, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        tracing::debug!("Streaming: {}", command);
        let mut child = Self::command(command)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(command, e))?;

        if let Some(stderr) = child.stderr.take() {
            if let Err(e) = read_lines(BufReader::new(stderr), on_line) {
                reap(&mut child, command);
                return Err(e.into());
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::tool_failed(&command.program, status.code()));
        }
        Ok(())
    }
}

/// Kill and wait a child whose output can no longer be read
fn reap(child: &mut Child, command: &ToolCommand) {
    if let Err(e) = child.kill() {
        tracing::debug!("Failed to kill {}: {}", command.program, e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!("Failed to reap {}: {}", command.program, e);
    }
}

/// Split a byte stream into lines on `\n` or `\r`.
///
/// Progress bars redraw with carriage returns, so both terminate a line.
pub fn read_lines<R: Read>(mut reader: R, on_line: &mut dyn FnMut(&str)) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !buffer.is_empty() {
                    on_line(&String::from_utf8_lossy(&buffer));
                    buffer.clear();
                }
            } else {
                buffer.push(byte);
            }
        }
    }

    if !buffer.is_empty() {
        on_line(&String::from_utf8_lossy(&buffer));
    }
    Ok(())
}
