//! Shadowing an image's layers and undoing it.
//!
//! An image is either unshadowed (the engine's identity store points at its own
//! layer directories) or shadowed (every identity points at a `shadow_` twin
//! whose `diff` is covered by a filtering mount).  [`ShadowEngine`] moves images
//! between the two states:
//!
//! - [`ShadowEngine::plan`] resolves the layers and saves a backup archive;
//!   [`ShadowPlan::materialize`] then creates the shadow directories next to
//!   the originals and redirects the identity store.
//! - [`ShadowEngine::restore`] points the identity store back at the originals.
//!   Shadow directories are left on disk.
//!
//! Neither restarts the engine; it only re-reads the identity store on start.

use std::{fmt, path::Path};

use log::{debug, info, warn};

use crate::{
    config::Config,
    engine::{ContainerEngine, GraphDriver, ImageInspect},
    error::{Error, Result},
    layer::{
        LayerIdentity, OriginalLayer, RestoreOutcome, ShadowLayer, SHADOW_MARKER, SHADOW_PREFIX,
    },
    mount::{create_mounts, FilterMount},
    resolver::{resolve_identities, resolve_layers, ResolvedLayer, StorageLayout},
    util::path_exists,
};

/// Whether an image's identity store currently points at shadow layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    Unshadowed,
    Shadowed,
}

impl ShadowState {
    /// Looks at the top layer directory the storage driver reports.
    ///
    /// A layer directory is a shadow when it carries the [`SHADOW_MARKER`] file or its
    /// name starts with [`SHADOW_PREFIX`].  Only the layer directory's own name counts,
    /// not the rest of the path.
    pub fn of_upper_dir(upper_dir: &Path) -> Self {
        let Some(layer_dir) = upper_dir.parent() else {
            return ShadowState::Unshadowed;
        };
        let prefixed = layer_dir
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(SHADOW_PREFIX));
        if prefixed || path_exists(layer_dir.join(SHADOW_MARKER)) {
            ShadowState::Shadowed
        } else {
            ShadowState::Unshadowed
        }
    }

    pub fn detect(graph: &GraphDriver) -> Result<Self> {
        Ok(Self::of_upper_dir(graph.upper_dir()?))
    }
}

impl fmt::Display for ShadowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShadowState::Unshadowed => "UNSHADOWED",
            ShadowState::Shadowed => "SHADOWED",
        })
    }
}

/// The `lower` file content for each shadow layer, topmost first.
///
/// Each entry lists the link ids of every layer below, nearest first.  The bottom layer
/// gets an empty string and keeps no `lower` file.
///
/// ```text
/// link ids, topmost first:  A          B      C
/// lower:                    l/B:l/C    l/C    (none)
/// ```
pub fn generate_lowers(shadows: &[ShadowLayer]) -> Vec<String> {
    let count = shadows.len();
    let mut lowers = vec![String::new(); count];
    for i in (0..count.saturating_sub(1)).rev() {
        let link = format!("l/{}", shadows[i + 1].layout().link_content());
        lowers[i] = if i + 1 == count - 1 {
            link
        } else {
            format!("{link}:{}", lowers[i + 1])
        };
    }
    lowers
}

/// Original and shadow layers of one image, topmost first, index for index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowPlan {
    image: String,
    originals: Vec<OriginalLayer>,
    shadows: Vec<ShadowLayer>,
}

impl ShadowPlan {
    /// Derives the shadow of every original and chains their `lower` files.  Pure.
    pub fn new(image: impl Into<String>, originals: Vec<OriginalLayer>) -> Self {
        let mut shadows: Vec<ShadowLayer> = originals.iter().map(OriginalLayer::shadow).collect();
        let lowers = generate_lowers(&shadows);
        let bottom = shadows.len().saturating_sub(1);
        for (shadow, lower) in shadows.iter_mut().zip(lowers).take(bottom) {
            shadow.set_lower(lower);
        }
        ShadowPlan {
            image: image.into(),
            originals,
            shadows,
        }
    }

    /// Plan for an image that is already shadowed, built from its resolved layers.
    pub fn from_shadows(image: impl Into<String>, layers: Vec<ResolvedLayer>) -> Result<Self> {
        let shadows: Vec<ShadowLayer> = layers
            .into_iter()
            .map(|layer| ShadowLayer::new(layer.layout, layer.identity))
            .collect();
        let originals = shadows
            .iter()
            .map(ShadowLayer::original)
            .collect::<Result<_>>()?;
        Ok(ShadowPlan {
            image: image.into(),
            originals,
            shadows,
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn originals(&self) -> &[OriginalLayer] {
        &self.originals
    }

    pub fn shadows(&self) -> &[ShadowLayer] {
        &self.shadows
    }

    /// Creates every shadow directory, then redirects the identity store.
    ///
    /// Redirection is all or nothing: when one layer fails, the layers this call
    /// redirected are restored before the error is returned.  Identities that already
    /// pointed at their shadow, such as a base layer shared with an image materialized
    /// earlier, are left alone.
    pub fn materialize(&self) -> Result<()> {
        for shadow in &self.shadows {
            shadow.dump()?;
        }
        let mut redirected: Vec<&ShadowLayer> = vec![];
        for shadow in &self.shadows {
            match shadow.redirect_identity() {
                Ok(true) => redirected.push(shadow),
                Ok(false) => (),
                Err(err) => {
                    warn!("redirecting {} failed, rolling back: {err}", self.image);
                    for layer in redirected {
                        if let Err(rollback) = layer.restore() {
                            warn!(
                                "rollback of {} failed: {rollback}",
                                layer.identity().cache_id_path.display()
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Points every identity back at its original layer.
    pub fn restore(&self) -> Result<Vec<RestoreOutcome>> {
        self.shadows.iter().map(ShadowLayer::restore).collect()
    }

    pub fn mounts(&self, config: &Config) -> Vec<FilterMount> {
        create_mounts(config, &self.originals, &self.shadows)
    }

    /// Bytes recorded under every shadow's `real/` so far.
    pub fn real_size(&self) -> Result<u64> {
        self.shadows.iter().map(ShadowLayer::real_size).sum()
    }
}

/// Result of [`ShadowEngine::plan`].
#[derive(Debug)]
pub enum ShadowOutcome {
    Shadowed(ShadowPlan),
    AlreadyShadowed,
}

/// Drives the shadow and restore transitions of images in one engine's storage.
pub struct ShadowEngine<'a, E: ContainerEngine> {
    engine: &'a E,
    config: &'a Config,
    storage: StorageLayout,
}

impl<'a, E: ContainerEngine> ShadowEngine<'a, E> {
    /// Uses the configured storage root, or asks the engine for it.
    pub fn new(engine: &'a E, config: &'a Config) -> Result<Self> {
        let root = match &config.storage_root {
            Some(root) => root.clone(),
            None => engine.storage_root()?,
        };
        debug!("storage root is {}", root.display());
        Ok(ShadowEngine {
            engine,
            config,
            storage: StorageLayout::new(root),
        })
    }

    pub fn engine(&self) -> &'a E {
        self.engine
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    pub fn state(&self, image: &str) -> Result<ShadowState> {
        let inspect = self.engine.inspect_image(image)?;
        ShadowState::detect(&inspect.graph_driver)
    }

    fn resolve(&self, inspect: &ImageInspect) -> Result<Vec<ResolvedLayer>> {
        resolve_layers(
            &self.storage,
            &inspect.graph_driver,
            &inspect.root_fs.layers,
        )
    }

    /// Prepares the shadowing of an unshadowed image without redirecting anything.
    ///
    /// The layers are resolved and the image is saved to the backup archive, which the
    /// export rebuilds from.  Call [`ShadowPlan::materialize`] afterwards.  A batch plans
    /// every image before materializing any, since a redirected base layer no longer
    /// matches what the engine reports for the other images sharing it.
    pub fn plan(&self, image: &str) -> Result<ShadowOutcome> {
        let inspect = self.engine.inspect_image(image)?;
        if ShadowState::detect(&inspect.graph_driver)? == ShadowState::Shadowed {
            info!("{image} is already shadowed");
            return Ok(ShadowOutcome::AlreadyShadowed);
        }

        let originals: Vec<OriginalLayer> = self
            .resolve(&inspect)?
            .into_iter()
            .map(|layer| OriginalLayer::new(layer.layout, layer.identity))
            .collect();
        if let Some(missing) = originals.iter().find(|layer| !layer.layout().has_diff()) {
            return Err(Error::Consistency(format!(
                "layer diff directory {} does not exist",
                missing.layout().diff_path().display()
            )));
        }

        self.config.ensure_work_dir()?;
        let backup = self.config.backup_archive(image);
        info!("saving {image} to {}", backup.display());
        self.engine.save_image(image, &backup)?;

        let plan = ShadowPlan::new(image, originals);
        debug!("{image} has {} layers", plan.shadows().len());
        Ok(ShadowOutcome::Shadowed(plan))
    }

    /// The current layers of a shadowed image, `None` for an unshadowed one.
    pub fn current_layers(&self, image: &str) -> Result<Option<ShadowPlan>> {
        let inspect = self.engine.inspect_image(image)?;
        self.current_layers_of(image, &inspect)
    }

    pub(crate) fn current_layers_of(
        &self,
        image: &str,
        inspect: &ImageInspect,
    ) -> Result<Option<ShadowPlan>> {
        match ShadowState::detect(&inspect.graph_driver)? {
            ShadowState::Unshadowed => Ok(None),
            ShadowState::Shadowed => {
                let layers = self.resolve(inspect)?;
                ShadowPlan::from_shadows(image, layers).map(Some)
            }
        }
    }

    /// Points a shadowed image's identities back at its original layers.
    ///
    /// Returns `None` when the image is not shadowed.  Filtering mounts are not touched;
    /// take them down first.
    pub fn restore(&self, image: &str) -> Result<Option<Vec<RestoreOutcome>>> {
        let inspect = self.engine.inspect_image(image)?;
        if ShadowState::detect(&inspect.graph_driver)? == ShadowState::Unshadowed {
            info!("{image} is not shadowed, nothing to restore");
            return Ok(None);
        }
        self.restore_identities(image, &inspect).map(Some)
    }

    /// Restores every identity of the image from its backup.  Only the identity store is
    /// read, so unreadable shadow directories do not get in the way.
    pub(crate) fn restore_identities(
        &self,
        image: &str,
        inspect: &ImageInspect,
    ) -> Result<Vec<RestoreOutcome>> {
        let outcomes = resolve_identities(&self.storage, &inspect.root_fs.layers)?
            .iter()
            .map(LayerIdentity::restore)
            .collect::<Result<Vec<_>>>()?;
        info!("restored {image}");
        Ok(outcomes)
    }
}

#[cfg(test)]
mod test {
    use std::{fs, path::PathBuf};

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::layer::LayerLayout;

    /// Three layers `c2`, `b1`, `a0` (topmost first) with link ids C, B, A.
    fn three_layers(tmp: &Path) -> Vec<OriginalLayer> {
        let overlay = tmp.join("overlay2");
        let layers = [
            ("c2", "C", Some("l/B:l/A")),
            ("b1", "B", Some("l/A")),
            ("a0", "A", None),
        ];
        layers
            .iter()
            .enumerate()
            .map(|(i, (name, link, lower))| {
                let dir = overlay.join(name);
                fs::create_dir_all(dir.join("diff")).unwrap();
                fs::write(dir.join("link"), link).unwrap();
                if let Some(lower) = lower {
                    fs::write(dir.join("lower"), lower).unwrap();
                }
                let meta = tmp.join("layerdb").join(i.to_string());
                fs::create_dir_all(&meta).unwrap();
                fs::write(meta.join("cache-id"), name).unwrap();
                OriginalLayer::new(
                    LayerLayout::read(dir).unwrap(),
                    LayerIdentity::read(meta).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_generate_lowers() {
        let tmp = TempDir::new().unwrap();
        let shadows: Vec<ShadowLayer> = three_layers(tmp.path())
            .iter()
            .map(|original| {
                let layout = original.layout().clone();
                ShadowLayer::new(layout, LayerIdentity::default())
            })
            .collect();
        assert_eq!(generate_lowers(&shadows), ["l/B:l/A", "l/A", ""]);
        assert_eq!(generate_lowers(&shadows[2..]), [""]);
        assert!(generate_lowers(&[]).is_empty());
    }

    #[test]
    fn test_plan_chains_shadow_links() {
        let tmp = TempDir::new().unwrap();
        let plan = ShadowPlan::new("app:1", three_layers(tmp.path()));
        let lowers: Vec<_> = plan
            .shadows()
            .iter()
            .map(|s| s.layout().lower_content())
            .collect();
        assert_eq!(lowers, ["l/shadow_B:l/shadow_A", "l/shadow_A", ""]);
        assert_eq!(plan.shadows()[2].layout().lower_path(), None);
        assert!(!tmp.path().join("overlay2/shadow_c2").exists());
    }

    #[test]
    fn test_detect() {
        let tmp = TempDir::new().unwrap();
        let overlay = tmp.path().join("overlay2");

        let upper = overlay.join("c2/diff");
        assert_eq!(ShadowState::of_upper_dir(&upper), ShadowState::Unshadowed);

        let upper = overlay.join("shadow_c2/diff");
        assert_eq!(ShadowState::of_upper_dir(&upper), ShadowState::Shadowed);

        // the prefix only counts on the layer directory itself
        let upper = tmp.path().join("shadow_root/overlay2/c2/diff");
        assert_eq!(ShadowState::of_upper_dir(&upper), ShadowState::Unshadowed);

        fs::create_dir_all(overlay.join("renamed/diff")).unwrap();
        fs::write(overlay.join("renamed").join(SHADOW_MARKER), "c2").unwrap();
        let upper = overlay.join("renamed/diff");
        assert_eq!(ShadowState::of_upper_dir(&upper), ShadowState::Shadowed);

        let graph = GraphDriver::overlay(overlay.join("shadow_c2/diff"), &[]);
        assert_eq!(ShadowState::detect(&graph).unwrap(), ShadowState::Shadowed);
        assert_eq!(ShadowState::Shadowed.to_string(), "SHADOWED");
    }

    #[test]
    fn test_materialize_and_restore() {
        let tmp = TempDir::new().unwrap();
        let plan = ShadowPlan::new("app:1", three_layers(tmp.path()));
        plan.materialize().unwrap();

        for shadow in plan.shadows() {
            let cache_id = fs::read_to_string(&shadow.identity().cache_id_path).unwrap();
            assert_eq!(cache_id, shadow.layout().layer_name());
            assert!(shadow.real_path().is_dir());
        }
        let top = PathBuf::from(plan.shadows()[0].layout().diff_path());
        assert_eq!(ShadowState::of_upper_dir(&top), ShadowState::Shadowed);

        assert_eq!(plan.restore().unwrap(), [RestoreOutcome::Restored; 3]);
        assert_eq!(plan.restore().unwrap(), [RestoreOutcome::AlreadyRestored; 3]);
        for original in plan.originals() {
            let cache_id = fs::read_to_string(&original.identity().cache_id_path).unwrap();
            assert_eq!(cache_id, original.layout().layer_name());
        }
    }

    #[test]
    fn test_materialize_rolls_back_identities() {
        let tmp = TempDir::new().unwrap();
        let plan = ShadowPlan::new("app:1", three_layers(tmp.path()));

        // the second layer's cache-id can no longer be backed up
        let middle = &plan.shadows()[1].identity().cache_id_path;
        fs::remove_file(middle).unwrap();
        fs::create_dir(middle).unwrap();
        assert!(plan.materialize().is_err());

        let top = plan.originals()[0].identity();
        assert_eq!(fs::read_to_string(&top.cache_id_path).unwrap(), "c2");
        let bottom = plan.originals()[2].identity();
        assert_eq!(fs::read_to_string(&bottom.cache_id_path).unwrap(), "a0");
        assert!(!bottom.backup_path().exists());
    }

    #[test]
    fn test_rollback_keeps_identities_redirected_before() {
        let tmp = TempDir::new().unwrap();
        let plan = ShadowPlan::new("app:1", three_layers(tmp.path()));

        // `b1` is shared with another image that is already materialized
        let middle = &plan.shadows()[1];
        middle.dump().unwrap();
        assert!(middle.redirect_identity().unwrap());

        // the bottom layer fails to redirect
        let bottom = &plan.shadows()[2].identity().cache_id_path;
        fs::remove_file(bottom).unwrap();
        fs::create_dir(bottom).unwrap();
        assert!(plan.materialize().is_err());

        let top = plan.originals()[0].identity();
        assert_eq!(fs::read_to_string(&top.cache_id_path).unwrap(), "c2");
        let middle = middle.identity();
        assert_eq!(fs::read_to_string(&middle.cache_id_path).unwrap(), "shadow_b1");
    }

    #[test]
    fn test_from_shadows_recovers_originals() {
        let tmp = TempDir::new().unwrap();
        let plan = ShadowPlan::new("app:1", three_layers(tmp.path()));
        plan.materialize().unwrap();

        let resolved = plan
            .shadows()
            .iter()
            .map(|shadow| ResolvedLayer {
                layout: LayerLayout::read(shadow.layout().layer_path()).unwrap(),
                identity: LayerIdentity::read(&shadow.identity().meta_path).unwrap(),
            })
            .collect();
        let current = ShadowPlan::from_shadows("app:1", resolved).unwrap();
        assert_eq!(current.originals(), plan.originals());
        assert_eq!(current.shadows(), plan.shadows());
    }
}
