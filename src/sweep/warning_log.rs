//! Append-only warning log, one file per sweep session.

use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::AppResult;

/// Writes `<timestamp> - High Field Detected Warning: <message>` lines to a session file.
#[derive(Debug, Clone)]
pub struct WarningLog {
    path: PathBuf,
}

impl WarningLog {
    /// Creates `dir` if needed and names the session file after the current local time.
    ///
    /// The file itself is only created by the first warning.
    pub fn create_session(dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let name = format!("log_{}.txt", Local::now().format("%Y-%m-%d_%H-%M-%S"));
        Ok(Self {
            path: dir.join(name),
        })
    }

    /// Uses an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Session file path. It may not exist until the first warning.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one warning line.
    pub fn append(&self, message: &str) -> AppResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "{} - High Field Detected Warning: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            message
        )?;
        warn!(log = %self.path.display(), "{}", message);
        Ok(())
    }
}
