//! Runtime configuration.
//!
//! Configuration is an explicit [`Config`] value handed to the batch driver.
//! It is read from an optional TOML file; every field has a default, so an
//! empty file (or no file at all) is valid:
//!
//! ```toml
//! work_dir = "/usr/local/shadowfs"
//! debloated_fs = "/usr/local/bin/debloated_fs"
//! tag_suffix = "-debloated"
//! restart_command = ["systemctl", "restart", "docker"]
//! unmount_timeout_secs = 10
//! ```
//!
//! The file is searched in:
//! - the path given with `--config`
//! - `$SHADOWFS_CONFIG`
//! - `/etc/shadowfs/config.toml`

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, LevelFilter};
use serde::Deserialize;

use crate::{
    error::{Error, PathContext, Result},
    mount::MOUNT_TYPE,
};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "SHADOWFS_CONFIG";

/// Environment variable holding the log level.
pub const LOG_ENV: &str = "SHADOWFS_LOG";

const SYSTEM_CONFIG: &str = "/etc/shadowfs/config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where original image backups and debloated archives are kept.
    pub work_dir: PathBuf,

    /// Parent directory for temporary archive extraction.
    pub scratch_dir: PathBuf,

    /// The filtering-mount executable.
    pub debloated_fs: PathBuf,

    /// Filesystem type the filtering mount shows up as in the mount table.
    pub mount_type: String,

    /// Passed through as `--optimize=` to the filtering mount.
    pub optimize: String,

    /// Appended to the first repo tag of a debloated image.
    pub tag_suffix: String,

    /// Container engine CLI.
    pub engine_binary: PathBuf,

    /// Command used to restart the engine daemon.
    pub restart_command: Vec<String>,

    /// Overrides the storage root reported by the engine.
    pub storage_root: Option<PathBuf>,

    pub unmount_timeout_secs: u64,
    pub engine_ready_timeout_secs: u64,
    pub poll_interval_ms: u64,

    /// Attempts per unmount before giving up.
    pub unmount_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: PathBuf::from("/usr/local/shadowfs"),
            scratch_dir: env::temp_dir(),
            debloated_fs: PathBuf::from("/usr/local/bin/debloated_fs"),
            mount_type: MOUNT_TYPE.to_string(),
            optimize: String::new(),
            tag_suffix: "-debloated".to_string(),
            engine_binary: PathBuf::from("docker"),
            restart_command: ["systemctl", "restart", "docker"]
                .map(String::from)
                .to_vec(),
            storage_root: None,
            unmount_timeout_secs: 10,
            engine_ready_timeout_secs: 60,
            poll_interval_ms: 200,
            unmount_retries: 5,
        }
    }
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| Error::Config(err.to_string()))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist.  Otherwise the first existing file of the default search
    /// paths is used, falling back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        for path in Self::default_search_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        debug!("reading configuration from {}", path.display());
        let content = fs::read_to_string(path).at(path)?;
        Self::from_toml(&content)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))
    }

    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = env::var_os(CONFIG_ENV) {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from(SYSTEM_CONFIG));
        paths
    }

    pub fn unmount_timeout(&self) -> Duration {
        Duration::from_secs(self.unmount_timeout_secs)
    }

    pub fn engine_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Where the untouched archive of `image` is saved before shadowing.
    pub fn backup_archive(&self, image: &str) -> PathBuf {
        self.work_dir.join(format!("{}.tar", archive_stem(image)))
    }

    /// Where the rebuilt archive of `image` is written by the export.
    pub fn debloated_archive(&self, image: &str) -> PathBuf {
        self.work_dir
            .join(format!("{}.debloated.tar", archive_stem(image)))
    }

    pub fn ensure_work_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.work_dir).at(&self.work_dir)
    }
}

/// File-name-safe form of an image reference: `ghcr.io/a/b:1` becomes `ghcr.io_a_b_1`.
pub fn archive_stem(image: &str) -> String {
    image.replace([':', '/'], "_")
}

/// Log level from the value of [`LOG_ENV`], `info` when unset or unparsable.
pub fn log_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}
