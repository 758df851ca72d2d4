//! The container engine seam.
//!
//! Everything shadowfs needs from the container engine goes through the
//! [`ContainerEngine`] trait: image inspection, saving and loading image
//! archives, the storage root, and a daemon restart.  [`DockerCli`] implements
//! it by driving the `docker` command-line client.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;
use serde::Deserialize;

use crate::{
    config::Config,
    error::{Error, Result},
    util::run_command,
};

/// The subset of `docker image inspect` output that shadowfs reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub graph_driver: GraphDriver,
    #[serde(rename = "RootFS")]
    pub root_fs: RootFs,
}

/// Storage-driver specific data.  For overlay2 this names the layer directories.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GraphDriver {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: Option<HashMap<String, String>>,
}

impl GraphDriver {
    /// Builds graph-driver data for overlay2 from an upper directory and the lower
    /// directories, topmost first.
    pub fn overlay(upper: impl AsRef<Path>, lowers: &[PathBuf]) -> Self {
        let mut data = HashMap::new();
        data.insert(
            "UpperDir".to_string(),
            upper.as_ref().to_string_lossy().into_owned(),
        );
        if !lowers.is_empty() {
            let lowers: Vec<_> = lowers.iter().map(|l| l.to_string_lossy()).collect();
            data.insert("LowerDir".to_string(), lowers.join(":"));
        }
        GraphDriver {
            name: "overlay2".to_string(),
            data: Some(data),
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key).map(String::as_str)
    }

    /// The `diff` directory of the topmost layer.
    pub fn upper_dir(&self) -> Result<&Path> {
        self.get("UpperDir")
            .filter(|dir| !dir.is_empty())
            .map(Path::new)
            .ok_or_else(|| {
                Error::Engine(format!(
                    "graph driver {:?} reports no UpperDir; only overlay2 is supported",
                    self.name
                ))
            })
    }

    /// The `diff` directories of every layer below the top, topmost first.
    pub fn lower_dirs(&self) -> Vec<&Path> {
        match self.get("LowerDir") {
            Some(lower) => lower
                .split(':')
                .filter(|dir| !dir.is_empty())
                .map(Path::new)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Upper directory followed by the lower directories: the whole stack, top to bottom.
    pub fn layer_dirs(&self) -> Result<Vec<&Path>> {
        let mut dirs = vec![self.upper_dir()?];
        dirs.extend(self.lower_dirs());
        Ok(dirs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RootFs {
    #[serde(default, rename = "Type")]
    pub kind: String,
    /// Diff ids, bottom to top.
    #[serde(default)]
    pub layers: Vec<String>,
}

/// Operations shadowfs needs from the container engine.
pub trait ContainerEngine {
    /// Inspects a local image by name or id.
    fn inspect_image(&self, name: &str) -> Result<ImageInspect>;

    /// Writes the image archive (`docker save` format) to `dest`.
    fn save_image(&self, name: &str, dest: &Path) -> Result<()>;

    /// Loads an image archive and returns the engine's status output.
    fn load_image(&self, archive: &Path) -> Result<String>;

    /// The engine's data root, e.g. `/var/lib/docker`.
    fn storage_root(&self) -> Result<PathBuf>;

    /// Restarts the engine daemon so it re-reads its layer metadata.
    fn restart(&self) -> Result<()>;

    /// Whether the daemon currently answers requests.
    fn is_ready(&self) -> bool;
}

/// [`ContainerEngine`] implemented on top of the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    restart_command: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DockerInfo {
    #[serde(rename = "DockerRootDir")]
    docker_root_dir: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>, restart_command: Vec<String>) -> Self {
        DockerCli {
            binary: binary.into(),
            restart_command,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.engine_binary, config.restart_command.clone())
    }

    fn docker(&self) -> Command {
        Command::new(&self.binary)
    }
}

impl ContainerEngine for DockerCli {
    fn inspect_image(&self, name: &str) -> Result<ImageInspect> {
        let stdout = run_command(self.docker().args(["image", "inspect", name]))?;
        let mut images: Vec<ImageInspect> = serde_json::from_slice(&stdout)
            .map_err(|err| Error::Engine(format!("cannot parse inspect output for {name}: {err}")))?;
        match images.len() {
            1 => Ok(images.remove(0)),
            n => Err(Error::Engine(format!(
                "inspect of {name} returned {n} images, expected exactly one"
            ))),
        }
    }

    fn save_image(&self, name: &str, dest: &Path) -> Result<()> {
        run_command(self.docker().arg("save").arg("-o").arg(dest).arg(name))?;
        Ok(())
    }

    fn load_image(&self, archive: &Path) -> Result<String> {
        let stdout = run_command(self.docker().arg("load").arg("-i").arg(archive))?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    fn storage_root(&self) -> Result<PathBuf> {
        let stdout = run_command(self.docker().args(["info", "--format", "{{json .}}"]))?;
        let info: DockerInfo = serde_json::from_slice(&stdout)
            .map_err(|err| Error::Engine(format!("cannot parse engine info: {err}")))?;
        Ok(info.docker_root_dir)
    }

    fn restart(&self) -> Result<()> {
        let Some((program, args)) = self.restart_command.split_first() else {
            return Err(Error::Config("restart_command is empty".to_string()));
        };
        run_command(Command::new(program).args(args))?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        match run_command(self.docker().args(["info", "--format", "{{.ID}}"])) {
            Ok(_) => true,
            Err(err) => {
                debug!("engine not ready yet: {err}");
                false
            }
        }
    }
}
