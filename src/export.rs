//! Rebuilding a shadowed image from the files it actually used.
//!
//! The backup archive saved when the image was shadowed supplies the archive
//! structure: manifest, config, layer metadata.  The payload of each replaced
//! layer becomes a tar of what the filtering mount recorded under the shadow
//! layer's `real/` directory, and the config's diff ids are recomputed to match.

use std::path::PathBuf;

use log::{debug, info};

use crate::{
    engine::ContainerEngine,
    error::{Error, Result},
    imgtar::ImgTarFs,
    layer::ShadowLayer,
    mount::unmount_stack,
    shadow::{ShadowEngine, ShadowPlan},
    util::{path_exists, untar},
};

/// A debloated archive ready to be loaded.
#[derive(Debug)]
pub struct ExportedImage {
    pub image: String,
    pub archive: PathBuf,
    /// The layers the archive was built from; restore them before restarting the engine.
    pub plan: ShadowPlan,
    /// How many layers, counted from the top, got a new payload.
    pub replaced: usize,
}

#[derive(Debug)]
pub enum ExportOutcome {
    /// The image is not shadowed, so nothing was observed and nothing is exported.
    NotShadowed,
    Exported(ExportedImage),
}

/// Fails unless every shadow layer has a layer slot in the archive.
pub fn check_layer_count(shadows: &[ShadowLayer], tarfs: &ImgTarFs) -> Result<()> {
    if shadows.len() != tarfs.layers().len() {
        return Err(Error::Consistency(format!(
            "image has {} shadow layers but its archive has {} layers",
            shadows.len(),
            tarfs.layers().len()
        )));
    }
    Ok(())
}

/// Replaces the payloads of the top `top` layers (all layers for `None`) with tars of the
/// shadow layers' `diff/`, and updates their diff ids.
///
/// Shadows are topmost first while archive layers are bottom first: shadow `i` fills
/// archive slot `count - 1 - i`.  Layers below the top `top` keep their payload and diff
/// id.  A slot whose payload file is shared with another slot gets a file of its own.
/// Nothing is touched when the layer counts disagree.
pub fn replace_layers(
    tarfs: &mut ImgTarFs,
    shadows: &[ShadowLayer],
    top: Option<usize>,
) -> Result<usize> {
    check_layer_count(shadows, tarfs)?;
    let count = shadows.len();
    let replaced = top.map_or(count, |top| top.min(count));

    for (i, shadow) in shadows.iter().enumerate().take(replaced) {
        let slot = count - 1 - i;
        let layer = if tarfs.is_shared(slot) {
            tarfs.detach_layer(slot)?.clone()
        } else {
            tarfs.layers()[slot].clone()
        };
        layer.remove_tar()?;
        shadow.tar_diff(layer.tar_path())?;
        let diff_id = layer.diff_id()?;
        debug!(
            "{} -> {} ({diff_id})",
            shadow.layout().diff_path().display(),
            layer.tar_path().display()
        );
        tarfs.set_diff_id(slot, diff_id)?;
    }
    Ok(replaced)
}

/// Rebuilds shadowed images into debloated archives.
pub struct ExportPipeline<'a, 'e, E: ContainerEngine> {
    shadow: &'a ShadowEngine<'e, E>,
}

impl<'a, 'e, E: ContainerEngine> ExportPipeline<'a, 'e, E> {
    pub fn new(shadow: &'a ShadowEngine<'e, E>) -> Self {
        ExportPipeline { shadow }
    }

    /// Exports `image` with only the content observed in use, limited to the top `top`
    /// layers when given.
    ///
    /// The filtering mounts of the image are taken down and each shadow layer's `real/`
    /// becomes its `diff/`.  The identity store is left pointing at the shadows; restore
    /// the returned plan before restarting the engine.
    pub fn export(&self, image: &str, top: Option<usize>) -> Result<ExportOutcome> {
        let config = self.shadow.config();
        let inspect = self.shadow.engine().inspect_image(image)?;
        let Some(plan) = self.shadow.current_layers_of(image, &inspect)? else {
            info!("{image} is not shadowed, nothing to export");
            return Ok(ExportOutcome::NotShadowed);
        };

        let backup = config.backup_archive(image);
        if !path_exists(&backup) {
            return Err(Error::Consistency(format!(
                "{image} is shadowed but its backup archive {} is missing",
                backup.display()
            )));
        }
        let scratch = tempfile::Builder::new()
            .prefix("shadowfs-export-")
            .tempdir_in(&config.scratch_dir)
            .map_err(|source| Error::Io {
                path: config.scratch_dir.clone(),
                source,
            })?;
        untar(&backup, scratch.path())?;
        let mut tarfs = ImgTarFs::parse(scratch.path())?;
        check_layer_count(plan.shadows(), &tarfs)?;

        let stack = inspect.graph_driver.layer_dirs()?;
        unmount_stack(&stack, config)?;

        for shadow in plan.shadows() {
            if shadow.promote_real()? {
                debug!("promoted {}", shadow.real_path().display());
            }
        }

        let replaced = replace_layers(&mut tarfs, plan.shadows(), top)?;
        tarfs.write_config()?;
        tarfs.tag_with_suffix(&config.tag_suffix);
        tarfs.write_manifest()?;

        config.ensure_work_dir()?;
        let archive = config.debloated_archive(image);
        tarfs.archive(&archive)?;
        info!(
            "exported {image} to {} ({replaced} of {} layers replaced)",
            archive.display(),
            plan.shadows().len()
        );

        Ok(ExportOutcome::Exported(ExportedImage {
            image: image.to_string(),
            archive,
            plan,
            replaced,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::{fs, path::Path};

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        imgtar::test::write_archive,
        layer::{LayerIdentity, LayerLayout, OriginalLayer},
        util::sha256_file,
    };

    fn payload_hashes(tarfs: &ImgTarFs) -> Vec<String> {
        tarfs
            .layers()
            .iter()
            .map(|layer| sha256_file(layer.tar_path()).unwrap())
            .collect()
    }

    /// Shadows of `layer<i>`, topmost first, each with one file in `diff/`.
    fn shadows(tmp: &Path, count: usize) -> Vec<ShadowLayer> {
        let overlay = tmp.join("overlay2");
        (0..count)
            .map(|i| {
                let dir = overlay.join(format!("layer{i}"));
                fs::create_dir_all(dir.join("diff")).unwrap();
                fs::write(dir.join("link"), format!("L{i}")).unwrap();
                let layout = LayerLayout::read(&dir).unwrap();
                let shadow = OriginalLayer::new(layout, LayerIdentity::default()).shadow();
                shadow.dump().unwrap();
                fs::write(shadow.layout().diff_path().join("used"), format!("{i}")).unwrap();
                shadow
            })
            .collect()
    }

    #[test]
    fn test_layer_count_mismatch_mutates_nothing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("img");
        fs::create_dir(&root).unwrap();
        write_archive(&root, &["a", "b", "c"]);
        let mut tarfs = ImgTarFs::parse(&root).unwrap();
        let before = payload_hashes(&tarfs);
        let diff_ids = tarfs.diff_ids().to_vec();

        let shadows = shadows(tmp.path(), 4);
        let err = replace_layers(&mut tarfs, &shadows, None).unwrap_err();
        assert!(err.is_consistency(), "{err}");

        assert_eq!(payload_hashes(&tarfs), before);
        assert_eq!(tarfs.diff_ids().to_vec(), diff_ids);
    }

    #[test]
    fn test_replace_all_layers() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("img");
        fs::create_dir(&root).unwrap();
        write_archive(&root, &["bottom", "top"]);
        let mut tarfs = ImgTarFs::parse(&root).unwrap();
        let shadows = shadows(tmp.path(), 2);

        assert_eq!(replace_layers(&mut tarfs, &shadows, None).unwrap(), 2);
        for (slot, layer) in tarfs.layers().iter().enumerate() {
            assert_eq!(tarfs.diff_ids()[slot], layer.diff_id().unwrap());
        }

        // shadow 0 is the top layer, so it lands in the last slot
        let mut tar = tar::Archive::new(fs::File::open(tarfs.layers()[1].tar_path()).unwrap());
        let mut found = false;
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap() == Path::new("used") {
                let mut content = String::new();
                std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
                assert_eq!(content, "0");
                found = true;
            }
        }
        assert!(found);
    }

    /// An archive in the blob layout whose two layers have identical payloads.
    fn write_blob_archive(root: &Path) {
        let blob = root.join("blobs/sha256/0000");
        fs::create_dir_all(blob.parent().unwrap()).unwrap();
        fs::write(&blob, "same").unwrap();
        let diff_id = format!("sha256:{}", sha256_file(&blob).unwrap());
        let config = serde_json::json!({
            "rootfs": {"type": "layers", "diff_ids": [diff_id, diff_id]},
        });
        fs::write(root.join("cfg.json"), config.to_string()).unwrap();
        let manifest = serde_json::json!([{
            "Config": "cfg.json",
            "RepoTags": ["dup:1"],
            "Layers": ["blobs/sha256/0000", "blobs/sha256/0000"],
        }]);
        fs::write(root.join("manifest.json"), manifest.to_string()).unwrap();
    }

    #[test]
    fn test_replace_identical_blob_layers() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("img");
        write_blob_archive(&root);
        let mut tarfs = ImgTarFs::parse(&root).unwrap();
        let shadows = shadows(tmp.path(), 2);

        assert_eq!(replace_layers(&mut tarfs, &shadows, None).unwrap(), 2);
        let (bottom, top) = (&tarfs.layers()[0], &tarfs.layers()[1]);
        assert_ne!(bottom.tar_path(), top.tar_path());
        assert_eq!(tarfs.diff_ids()[0], bottom.diff_id().unwrap());
        assert_eq!(tarfs.diff_ids()[1], top.diff_id().unwrap());
        assert_ne!(tarfs.diff_ids()[0], tarfs.diff_ids()[1]);

        tarfs.write_manifest().unwrap();
        let reparsed = ImgTarFs::parse(&root).unwrap();
        assert_eq!(reparsed.layers(), tarfs.layers());
    }

    #[test]
    fn test_replace_top_of_identical_blob_layers() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("img");
        write_blob_archive(&root);
        let mut tarfs = ImgTarFs::parse(&root).unwrap();
        let original_ids = tarfs.diff_ids().to_vec();
        let shadows = shadows(tmp.path(), 2);

        assert_eq!(replace_layers(&mut tarfs, &shadows, Some(1)).unwrap(), 1);
        let bottom = &tarfs.layers()[0];
        assert_eq!(fs::read_to_string(bottom.tar_path()).unwrap(), "same");
        assert_eq!(tarfs.diff_ids()[0], original_ids[0]);
        assert_eq!(tarfs.diff_ids()[1], tarfs.layers()[1].diff_id().unwrap());
    }

    #[test]
    fn test_replace_top_layers_only() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("img");
        fs::create_dir(&root).unwrap();
        write_archive(&root, &["bottom", "middle", "top"]);
        let mut tarfs = ImgTarFs::parse(&root).unwrap();
        let original_ids = tarfs.diff_ids().to_vec();
        let shadows = shadows(tmp.path(), 3);

        assert_eq!(replace_layers(&mut tarfs, &shadows, Some(1)).unwrap(), 1);
        assert_eq!(&tarfs.diff_ids()[..2], &original_ids[..2]);
        assert_ne!(tarfs.diff_ids()[2], original_ids[2]);
        assert_eq!(fs::read_to_string(tarfs.layers()[0].tar_path()).unwrap(), "bottom");

        assert_eq!(replace_layers(&mut tarfs, &shadows, Some(10)).unwrap(), 3);
        assert_eq!(replace_layers(&mut tarfs, &shadows, Some(0)).unwrap(), 0);
    }
}
