//! Configuration and scratch paths
//!
//! Config lives in the platform config dir. Node data directories are
//! created fresh per run under the system temp dir.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Name used for config and data directories
const APP_NAME: &str = "proxy-resync";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/proxy-resync/`
/// - macOS: `~/Library/Application Support/proxy-resync/`
/// - Windows: `%APPDATA%\proxy-resync\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// A node's exclusively owned data directory
///
/// Removed on drop unless it was kept.
#[derive(Debug)]
pub struct DataDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl DataDir {
    /// Create a fresh, empty directory for the named node
    pub fn create(node_name: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", APP_NAME, node_name))
            .tempdir()?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory on disk after this value is dropped
    pub fn keep(&mut self) -> PathBuf {
        if let Some(dir) = self.dir.take() {
            let _ = dir.keep();
        }
        self.path.clone()
    }
}
