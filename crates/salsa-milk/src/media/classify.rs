//! Splits user inputs into remote targets and local files

use std::path::{Path, PathBuf};

/// URI schemes treated as remote targets
pub const REMOTE_SCHEMES: &[&str] = &["http://", "https://"];

/// Inputs partitioned by origin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSet {
    /// Strings to hand to the downloader
    pub remote: Vec<String>,
    /// Existing local files, as absolute paths
    pub local: Vec<PathBuf>,
}

impl InputSet {
    pub fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.local.is_empty()
    }
}

/// Whether an input should be fetched rather than read from disk
pub fn is_remote(input: &str) -> bool {
    REMOTE_SCHEMES.iter().any(|scheme| input.starts_with(scheme))
}

/// Partition inputs. Missing local files are logged and dropped.
pub fn classify_inputs<S: AsRef<str>>(inputs: &[S]) -> InputSet {
    let mut set = InputSet::default();

    for input in inputs {
        let input = input.as_ref();
        if is_remote(input) {
            set.remote.push(input.to_string());
            continue;
        }

        let path = Path::new(input);
        if !path.exists() {
            tracing::warn!("Skipping missing file: {}", input);
            continue;
        }

        match path.canonicalize() {
            Ok(absolute) => set.local.push(absolute),
            Err(e) => tracing::warn!("Skipping unreadable path {}: {}", input, e),
        }
    }

    set
}
