//! Platform directories for configuration and logs.

use std::path::{Path, PathBuf};

use crate::error::AppError;

const APP_NAME: &str = "nebula-terrain";

/// OS-specific locations (XDG on Linux, Known Folders on Windows, Library
/// on macOS).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformDirs {
    /// Holds `config.ron`.
    pub config_dir: PathBuf,
    /// JSON log files from debug builds.
    pub log_dir: PathBuf,
}

impl PlatformDirs {
    /// Resolve without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NoPlatformDirs`] if the OS exposes no
    /// configuration directory.
    pub fn resolve() -> Result<Self, AppError> {
        let base = dirs::config_dir().ok_or(AppError::NoPlatformDirs)?;
        Ok(Self::resolve_with_root(&base))
    }

    /// Resolve under `root`; used by tests and `--config`.
    pub fn resolve_with_root(root: &Path) -> Self {
        let app_dir = root.join(APP_NAME);
        Self {
            config_dir: app_dir.join("config"),
            log_dir: app_dir.join("logs"),
        }
    }

    /// Use `config_dir` as given and keep logs next to it.
    pub fn with_config_dir(config_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            log_dir: config_dir.join("logs"),
        }
    }

    /// # Errors
    ///
    /// Returns [`AppError::Io`] if a directory cannot be created.
    pub fn create_dirs(&self) -> Result<(), AppError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
