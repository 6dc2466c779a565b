//! salsa-milk: vocal isolation for audio and video files
//!
//! Local files and YouTube URLs are normalized with ffmpeg, split with demucs
//! and remuxed so that only the vocals remain, keeping the original video
//! stream when there is one. The same pipeline backs a command-line tool and
//! an upload server with progress polling.

pub mod cli;
pub mod config;
pub mod error;
pub mod media;
pub mod server;
pub mod tasks;

pub use config::SalsaConfig;
pub use error::{Error, Result};
pub use media::{BatchProcessor, MediaProcessor, ProcessingRequest, ProcessingResult};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
