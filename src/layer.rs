//! Overlay layer layouts and their original/shadow forms.
//!
//! An overlay2 layer directory looks like this:
//! ```text
//! {storage_root}/overlay2/
//! +-- <layer-name>/
//! |   +-- diff/          # layer content
//! |   +-- link           # short link id
//! |   +-- lower          # "l/<link-id>:l/<link-id>:...", absent for the bottom layer
//! |   +-- real/          # shadow layers only: files the filtering mount saw in use
//! +-- l/
//!     +-- <link-id> -> ../<layer-name>/diff
//! ```
//!
//! The engine maps each layer's content-hash identity to a layer directory
//! through a separate identity store:
//! ```text
//! {storage_root}/image/overlay2/layerdb/sha256/<chain-id>/
//! +-- cache-id           # <layer-name>
//! +-- size
//! ```
//!
//! [`LayerLayout`] describes the first, [`LayerIdentity`] the second.  An
//! [`OriginalLayer`] is an engine-created layer; its [`ShadowLayer`] lives next
//! to it under the same name with a `shadow_` prefix.  Converting between the
//! two only computes paths; filesystem changes happen in
//! [`ShadowLayer::dump`], [`ShadowLayer::redirect_identity`] and
//! [`ShadowLayer::restore`].

use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::{
    error::{Error, PathContext, Result},
    util::{copy_file, dir_size, move_path, path_exists, tar_dir},
};

/// Prefix of every shadow layer name, link id and cache id.
pub const SHADOW_PREFIX: &str = "shadow_";

/// File in a shadow layer directory that names the layer it shadows.
pub const SHADOW_MARKER: &str = "shadowfs-origin";

/// The on-disk layout of one overlay2 layer directory.  All paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerLayout {
    layer_path: PathBuf,
    diff_path: PathBuf,
    link_path: PathBuf,
    lower_path: Option<PathBuf>,
    link_content: String,
    lower_content: String,
    l_link_path: PathBuf,
    layer_name: String,
}

impl LayerLayout {
    /// Reads a layer directory.
    ///
    /// A `diff` that cannot be seen is only logged: a crashed filtering mount on top of it
    /// fails every `stat` until it is unmounted.  Use [`Self::has_diff`] where the content
    /// is needed.
    ///
    /// # Errors
    ///
    /// A missing `link` file is a consistency error: the engine reported a layer that is
    /// not there.
    pub fn read(layer_path: impl Into<PathBuf>) -> Result<Self> {
        let layer_path = layer_path.into();
        let diff_path = layer_path.join("diff");
        if !diff_path.is_dir() {
            warn!("layer diff directory {} is not accessible", diff_path.display());
        }

        let link_path = layer_path.join("link");
        let link_content = match fs::read_to_string(&link_path) {
            Ok(content) => content.trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::Consistency(format!(
                    "layer link file {} does not exist",
                    link_path.display()
                )))
            }
            Err(err) => return Err(err).at(&link_path),
        };

        let lower = layer_path.join("lower");
        let (lower_path, lower_content) = match fs::read_to_string(&lower) {
            Ok(content) => (Some(lower), content.trim().to_string()),
            // bottom layer
            Err(err) if err.kind() == ErrorKind::NotFound => (None, String::new()),
            Err(err) => return Err(err).at(&lower),
        };

        let layer_name = file_name(&layer_path)?;
        let l_link_path = parent(&layer_path).join("l").join(&link_content);

        Ok(LayerLayout {
            layer_path,
            diff_path,
            link_path,
            lower_path,
            link_content,
            lower_content,
            l_link_path,
            layer_name,
        })
    }

    /// Layout of the same layer under a different name, computed without touching disk.
    fn renamed(&self, layer_name: &str, link_content: &str) -> Self {
        let overlay_dir = parent(&self.layer_path);
        let layer_path = overlay_dir.join(layer_name);
        LayerLayout {
            diff_path: layer_path.join("diff"),
            link_path: layer_path.join("link"),
            lower_path: self.lower_path.as_ref().map(|_| layer_path.join("lower")),
            link_content: link_content.to_string(),
            lower_content: String::new(),
            l_link_path: overlay_dir.join("l").join(link_content),
            layer_name: layer_name.to_string(),
            layer_path,
        }
    }

    pub fn layer_path(&self) -> &Path {
        &self.layer_path
    }

    pub fn diff_path(&self) -> &Path {
        &self.diff_path
    }

    pub fn link_path(&self) -> &Path {
        &self.link_path
    }

    /// `None` for the bottom layer of a chain.
    pub fn lower_path(&self) -> Option<&Path> {
        self.lower_path.as_deref()
    }

    pub fn link_content(&self) -> &str {
        &self.link_content
    }

    pub fn lower_content(&self) -> &str {
        &self.lower_content
    }

    /// The `l/<link-id>` symlink pointing at this layer's `diff`.
    pub fn l_link_path(&self) -> &Path {
        &self.l_link_path
    }

    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    /// Link ids of the layers below, nearest first, parsed from `lower`.
    pub fn lower_links(&self) -> Vec<&str> {
        self.lower_content
            .split(':')
            .filter_map(|s| s.strip_prefix("l/"))
            .collect()
    }

    pub fn has_diff(&self) -> bool {
        self.diff_path.is_dir()
    }

    pub fn is_shadow(&self) -> bool {
        self.layer_name.starts_with(SHADOW_PREFIX)
    }
}

fn parent(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new("/"))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Consistency(format!("{} has no layer name", path.display())))
}

/// Where the engine's identity store records a layer.  All paths are absolute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerIdentity {
    /// `layerdb/sha256/<chain-id>`
    pub meta_path: PathBuf,
    pub cache_id_path: PathBuf,
    /// Layer directory name the identity currently resolves to.
    pub cache_id: String,
    pub size_path: PathBuf,
    /// Contents of the `size` file, if the engine wrote one.
    pub size: Option<String>,
}

impl LayerIdentity {
    /// Reads the identity store entry at `meta_path`.
    ///
    /// # Errors
    ///
    /// A missing `cache-id` is a consistency error.
    pub fn read(meta_path: impl Into<PathBuf>) -> Result<Self> {
        let meta_path = meta_path.into();
        let cache_id_path = meta_path.join("cache-id");
        let cache_id = match fs::read_to_string(&cache_id_path) {
            Ok(content) => content.trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::Consistency(format!(
                    "identity store has no cache-id at {}",
                    cache_id_path.display()
                )))
            }
            Err(err) => return Err(err).at(&cache_id_path),
        };

        let size_path = meta_path.join("size");
        let size = match fs::read_to_string(&size_path) {
            Ok(content) => Some(content.trim().to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err).at(&size_path),
        };

        Ok(LayerIdentity {
            meta_path,
            cache_id_path,
            cache_id,
            size_path,
            size,
        })
    }

    /// The saved copy of the engine's own `cache-id`.
    pub fn backup_path(&self) -> PathBuf {
        let mut path = self.cache_id_path.clone().into_os_string();
        path.push(".bak");
        PathBuf::from(path)
    }

    /// Writes the saved `cache-id` back.  Needs nothing but the identity store.
    pub fn restore(&self) -> Result<RestoreOutcome> {
        let backup = self.backup_path();
        let saved = match fs::read(&backup) {
            Ok(saved) => saved,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    "no cache-id backup at {}, leaving {} as is",
                    backup.display(),
                    self.cache_id_path.display()
                );
                return Ok(RestoreOutcome::NoBackup);
            }
            Err(err) => return Err(err).at(&backup),
        };

        match fs::read(&self.cache_id_path) {
            Ok(current) if current == saved => return Ok(RestoreOutcome::AlreadyRestored),
            Ok(_) => (),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => return Err(err).at(&self.cache_id_path),
        }
        fs::write(&self.cache_id_path, saved).at(&self.cache_id_path)?;
        Ok(RestoreOutcome::Restored)
    }
}

/// An unmodified, engine-managed layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalLayer {
    layout: LayerLayout,
    identity: LayerIdentity,
}

impl OriginalLayer {
    pub fn new(layout: LayerLayout, identity: LayerIdentity) -> Self {
        OriginalLayer { layout, identity }
    }

    pub fn layout(&self) -> &LayerLayout {
        &self.layout
    }

    pub fn identity(&self) -> &LayerIdentity {
        &self.identity
    }

    /// The shadow counterpart of this layer.  Pure: nothing is created on disk.
    ///
    /// Names and link ids get [`SHADOW_PREFIX`]; identity-store paths are shared, since it
    /// is the identity that gets redirected.  The lower chain starts out empty and is
    /// assigned with [`ShadowLayer::set_lower`].
    pub fn shadow(&self) -> ShadowLayer {
        let layer_name = format!("{SHADOW_PREFIX}{}", self.layout.layer_name);
        let link_content = format!("{SHADOW_PREFIX}{}", self.layout.link_content);
        let layout = self.layout.renamed(&layer_name, &link_content);
        let identity = LayerIdentity {
            cache_id: layer_name,
            ..self.identity.clone()
        };
        ShadowLayer::new(layout, identity)
    }
}

/// Outcome of rolling one identity pointer back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// `cache-id` was rewritten from its backup.
    Restored,
    /// `cache-id` already matched its backup.
    AlreadyRestored,
    /// There is no backup; the layer was never redirected.
    NoBackup,
}

/// A shadow of an [`OriginalLayer`]: same identity, separate directory, plus `real/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowLayer {
    layout: LayerLayout,
    identity: LayerIdentity,
    real_path: PathBuf,
}

impl ShadowLayer {
    /// Wraps a layout the resolver found on disk.
    pub fn new(layout: LayerLayout, identity: LayerIdentity) -> Self {
        let real_path = layout.layer_path.join("real");
        ShadowLayer {
            layout,
            identity,
            real_path,
        }
    }

    pub fn layout(&self) -> &LayerLayout {
        &self.layout
    }

    pub fn identity(&self) -> &LayerIdentity {
        &self.identity
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    /// Replaces the chain written to `lower`.  Ignored on disk for the bottom layer.
    pub fn set_lower(&mut self, lower: impl Into<String>) {
        self.layout.lower_content = lower.into();
    }

    fn original_name(&self) -> Result<(&str, &str)> {
        let name = self.layout.layer_name.strip_prefix(SHADOW_PREFIX);
        let link = self.layout.link_content.strip_prefix(SHADOW_PREFIX);
        match (name, link) {
            (Some(name), Some(link)) => Ok((name, link)),
            _ => Err(Error::Consistency(format!(
                "{} is not a shadow layer",
                self.layout.layer_path.display()
            ))),
        }
    }

    /// Layout of the original layer, computed from names alone.
    ///
    /// `lower_content` is unknown without reading the original and is left empty.
    pub fn original_layout(&self) -> Result<LayerLayout> {
        let (name, link) = self.original_name()?;
        Ok(self.layout.renamed(name, link))
    }

    /// The original layer as it is on disk, carrying this layer's identity.
    pub fn original(&self) -> Result<OriginalLayer> {
        let (name, _) = self.original_name()?;
        let layout = LayerLayout::read(parent(&self.layout.layer_path).join(name))?;
        let identity = LayerIdentity {
            cache_id: name.to_string(),
            ..self.identity.clone()
        };
        Ok(OriginalLayer::new(layout, identity))
    }

    /// Creates the shadow layer directory tree.
    ///
    /// Anything that already exists is kept, so a repeated dump after a partial one
    /// completes it.  The identity store is not touched; see [`Self::redirect_identity`].
    pub fn dump(&self) -> Result<()> {
        let layout = &self.layout;
        create_dir(&layout.layer_path)?;
        create_dir(&layout.diff_path)?;
        fs::write(&layout.link_path, &layout.link_content).at(&layout.link_path)?;
        if let Some(lower_path) = &layout.lower_path {
            fs::write(lower_path, &layout.lower_content).at(lower_path)?;
        }
        create_dir(&self.real_path)?;

        let marker = layout.layer_path.join(SHADOW_MARKER);
        let (original, _) = self.original_name()?;
        fs::write(&marker, original).at(&marker)?;

        let target = Path::new("..").join(&layout.layer_name).join("diff");
        match symlink(&target, &layout.l_link_path) {
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!("{} already exists", layout.l_link_path.display());
                Ok(())
            }
            res => res.at(&layout.l_link_path),
        }
    }

    /// Points the layer's identity at this shadow directory.
    ///
    /// The engine's `cache-id` is saved to `cache-id.bak` first, unless a backup already
    /// exists: a second redirect must not overwrite the backup with a shadow id.  Returns
    /// false when the identity already pointed here, e.g. at a base layer shared with an
    /// image shadowed earlier in the batch.
    pub fn redirect_identity(&self) -> Result<bool> {
        let identity = &self.identity;
        match fs::read_to_string(&identity.cache_id_path) {
            Ok(current) if current.trim() == identity.cache_id => {
                debug!("{} already redirected", identity.cache_id_path.display());
                return Ok(false);
            }
            Ok(_) => (),
            Err(err) => return Err(err).at(&identity.cache_id_path),
        }

        let backup = identity.backup_path();
        if !path_exists(&backup) {
            copy_file(&identity.cache_id_path, &backup)?;
        } else {
            debug!("{} already exists", backup.display());
        }
        fs::write(&identity.cache_id_path, &identity.cache_id).at(&identity.cache_id_path)?;
        Ok(true)
    }

    /// Points the layer's identity back at the original directory.
    ///
    /// Only `cache-id` changes; the shadow directories stay where they are.
    pub fn restore(&self) -> Result<RestoreOutcome> {
        self.identity.restore()
    }

    /// Makes the observed `real/` content the layer payload.
    ///
    /// Returns false, changing nothing, when there is no `real/` directory: nothing was
    /// observed, or the layer was promoted before.
    pub fn promote_real(&self) -> Result<bool> {
        if !path_exists(&self.real_path) {
            debug!(
                "{} does not exist, layer already exported or never used",
                self.real_path.display()
            );
            return Ok(false);
        }
        let diff = &self.layout.diff_path;
        match fs::remove_dir_all(diff) {
            Err(err) if err.kind() != ErrorKind::NotFound => return Err(err).at(diff),
            _ => (),
        }
        move_path(&self.real_path, diff)?;
        Ok(true)
    }

    /// Bytes recorded under `real/` so far.
    pub fn real_size(&self) -> Result<u64> {
        if path_exists(&self.real_path) {
            dir_size(&self.real_path)
        } else {
            Ok(0)
        }
    }

    /// Archives `diff/` into a layer tar at `dest`.
    pub fn tar_diff(&self, dest: impl AsRef<Path>) -> Result<()> {
        tar_dir(&self.layout.diff_path, dest)
    }
}

fn create_dir(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            debug!("{} already exists", path.display());
            Ok(())
        }
        res => res.at(path),
    }
}
