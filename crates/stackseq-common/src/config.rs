//! Global configuration model for a resolution and startup pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ENV_FILE, DEFAULT_RESTART_DELAY, DEFAULT_STARTUP_TIMEOUT, DEFAULT_STOP_GRACE,
};

/// Root configuration for stackseq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Directory relative paths and default files are resolved against.
    pub project_dir: PathBuf,
    /// Environment files in precedence order (last wins).
    pub env_files: Vec<PathBuf>,
    /// Whether the process environment overlays the env files.
    pub inherit_process_env: bool,
    /// Deadline for every service to reach its required state.
    pub startup_timeout: Duration,
    /// Time a service gets to stop before a forced stop is issued.
    pub stop_grace: Duration,
    /// Pause between a service ending and its restart.
    pub restart_delay: Duration,
}

impl StackConfig {
    /// Returns the env files to read.
    ///
    /// When none were configured, falls back to `.env` in the project
    /// directory if it exists.
    #[must_use]
    pub fn effective_env_files(&self) -> Vec<PathBuf> {
        if !self.env_files.is_empty() {
            return self
                .env_files
                .iter()
                .map(|p| self.resolve_path(p))
                .collect();
        }
        let default = self.project_dir.join(DEFAULT_ENV_FILE);
        if default.is_file() {
            vec![default]
        } else {
            Vec::new()
        }
    }

    /// Resolves `path` against the project directory unless absolute.
    #[must_use]
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            env_files: Vec::new(),
            inherit_process_env: true,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}
