//! The exploded form of an image archive written by `docker save`.
//!
//! ```text
//! manifest.json           [{"Config": ..., "RepoTags": [...], "Layers": [...]}]
//! <config>.json           image config; rootfs.diff_ids lists layers bottom first
//! <layer-id>/layer.tar    one per manifest layer, bottom first
//! <layer-id>/json
//! <layer-id>/VERSION
//! ```
//!
//! Only the layer list, the diff ids and the repo tags are interpreted.  Every
//! other field of the manifest and the config is carried through unchanged.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{Error, PathContext, Result},
    util::{path_exists, sha256_file, tar_dir},
};

pub const MANIFEST: &str = "manifest.json";

/// One image in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    pub config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_tags: Option<Vec<String>>,
    /// Layer tar paths relative to the archive root, bottom first.
    pub layers: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub rootfs: RootFsConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFsConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Bottom first.
    pub diff_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Files belonging to one layer of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImgTarLayer {
    tar_path: PathBuf,
    json_path: Option<PathBuf>,
    version_path: Option<PathBuf>,
}

impl ImgTarLayer {
    fn new(root: &Path, layer: &str) -> Self {
        let tar_path = root.join(layer);
        // legacy layout keeps metadata next to `<id>/layer.tar`
        let (json_path, version_path) = match layer.strip_suffix("layer.tar") {
            Some(dir) => {
                let dir = root.join(dir);
                (Some(dir.join("json")), Some(dir.join("VERSION")))
            }
            None => (None, None),
        };
        ImgTarLayer {
            tar_path,
            json_path,
            version_path,
        }
    }

    pub fn tar_path(&self) -> &Path {
        &self.tar_path
    }

    pub fn json_path(&self) -> Option<&Path> {
        self.json_path.as_deref()
    }

    pub fn version_path(&self) -> Option<&Path> {
        self.version_path.as_deref()
    }

    /// Deletes the layer payload.  A payload that is already gone is fine.
    pub fn remove_tar(&self) -> Result<()> {
        match fs::remove_file(&self.tar_path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} already removed", self.tar_path.display());
                Ok(())
            }
            res => res.at(&self.tar_path),
        }
    }

    /// The diff id of the payload: `sha256:<hex>` of the uncompressed tar.
    pub fn diff_id(&self) -> Result<String> {
        Ok(format!("sha256:{}", sha256_file(&self.tar_path)?))
    }
}

/// An image archive unpacked into a directory.
#[derive(Debug)]
pub struct ImgTarFs {
    root: PathBuf,
    manifest: Vec<ManifestEntry>,
    config_path: PathBuf,
    config: ImageConfig,
    layers: Vec<ImgTarLayer>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).at(path)?;
    serde_json::from_slice(&data).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, data).at(path)
}

impl ImgTarFs {
    /// Parses the first image of the archive unpacked at `root`.
    ///
    /// # Errors
    ///
    /// A consistency error when the manifest lists no image, or when its layer list and
    /// the config's diff ids differ in length.
    pub fn parse(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let manifest: Vec<ManifestEntry> = read_json(&root.join(MANIFEST))?;
        let Some(entry) = manifest.first() else {
            return Err(Error::Consistency(format!(
                "{} lists no images",
                root.join(MANIFEST).display()
            )));
        };

        let config_path = root.join(&entry.config);
        let config: ImageConfig = read_json(&config_path)?;
        let layers: Vec<ImgTarLayer> = entry
            .layers
            .iter()
            .map(|layer| ImgTarLayer::new(&root, layer))
            .collect();

        if layers.len() != config.rootfs.diff_ids.len() {
            return Err(Error::Consistency(format!(
                "manifest lists {} layers but the config has {} diff ids",
                layers.len(),
                config.rootfs.diff_ids.len()
            )));
        }
        debug!("{} has {} layers", root.display(), layers.len());

        Ok(ImgTarFs {
            root,
            manifest,
            config_path,
            config,
            layers,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bottom first.
    pub fn layers(&self) -> &[ImgTarLayer] {
        &self.layers
    }

    /// Bottom first.
    pub fn diff_ids(&self) -> &[String] {
        &self.config.rootfs.diff_ids
    }

    pub fn repo_tags(&self) -> &[String] {
        self.manifest
            .first()
            .and_then(|entry| entry.repo_tags.as_deref())
            .unwrap_or_default()
    }

    pub fn set_diff_id(&mut self, index: usize, diff_id: String) -> Result<()> {
        let count = self.config.rootfs.diff_ids.len();
        let slot = self.config.rootfs.diff_ids.get_mut(index).ok_or_else(|| {
            Error::Consistency(format!("diff id {index} out of range, image has {count}"))
        })?;
        *slot = diff_id;
        Ok(())
    }

    /// Whether another layer slot refers to the same payload file as slot `index`.
    ///
    /// The blob layout names payloads by digest, so identical layers share one file.
    pub fn is_shared(&self, index: usize) -> bool {
        let Some(layer) = self.layers.get(index) else {
            return false;
        };
        self.layers
            .iter()
            .enumerate()
            .any(|(other, l)| other != index && l.tar_path == layer.tar_path)
    }

    /// Gives slot `index` a payload path of its own, `<path>.<index>`, in the manifest.
    /// Nothing is written; the new payload file does not exist yet.
    pub fn detach_layer(&mut self, index: usize) -> Result<&ImgTarLayer> {
        let count = self.layers.len();
        let entry = self
            .manifest
            .first_mut()
            .and_then(|entry| entry.layers.get_mut(index))
            .ok_or_else(|| {
                Error::Consistency(format!("layer {index} out of range, image has {count}"))
            })?;
        entry.push_str(&format!(".{index}"));
        debug!("layer {index} now stored at {entry}");
        self.layers[index] = ImgTarLayer::new(&self.root, entry);
        Ok(&self.layers[index])
    }

    /// Appends `suffix` to the first repo tag, so the rebuilt image does not replace the
    /// original on load.  Untagged images stay untagged.
    pub fn tag_with_suffix(&mut self, suffix: &str) {
        if let Some(tag) = self
            .manifest
            .first_mut()
            .and_then(|entry| entry.repo_tags.as_mut())
            .and_then(|tags| tags.first_mut())
        {
            tag.push_str(suffix);
        }
    }

    pub fn write_config(&self) -> Result<()> {
        write_json(&self.config_path, &self.config)
    }

    pub fn write_manifest(&self) -> Result<()> {
        write_json(&self.root.join(MANIFEST), &self.manifest)
    }

    /// Packs the directory back into a single image archive at `dest`.
    pub fn archive(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if path_exists(dest) {
            fs::remove_file(dest).at(dest)?;
        }
        tar_dir(&self.root, dest)
    }
}
