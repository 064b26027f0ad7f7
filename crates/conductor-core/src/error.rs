//! Error types for the settings store.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or saving settings.
#[derive(Error, Debug, Clone)]
pub enum SettingsError {
    /// Reading, writing or creating the settings file failed
    #[error("Settings I/O failed for {path}: {error}")]
    Io { path: PathBuf, error: String },
}

/// Result type for settings operations.
pub type SettingsResult<T> = Result<T, SettingsError>;
