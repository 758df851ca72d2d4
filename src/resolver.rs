//! Correlating an image's diff-id chain with overlay2 layer directories.
//!
//! The storage driver reports an image as an upper directory plus a list of
//! lower directories, topmost first.  The engine describes the same image as
//! a list of diff ids, bottom first.  The only link between the two is the
//! identity store: folding the diff ids into chain ids gives the
//! `layerdb/sha256/<chain-id>` directories, and each of those holds a
//! `cache-id` naming the overlay2 directory of that layer.

use std::path::{Path, PathBuf};

use log::debug;

use crate::{
    engine::GraphDriver,
    error::{Error, Result},
    layer::{LayerIdentity, LayerLayout},
    util::sha256_hex,
};

/// Where the overlay2 driver keeps layer directories, relative to the storage root.
pub const OVERLAY_DIR: &str = "overlay2";

/// Where the engine keeps its identity store, relative to the storage root.
pub const LAYERDB_DIR: &str = "image/overlay2/layerdb/sha256";

/// The engine's data root and the directories derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StorageLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join(OVERLAY_DIR)
    }

    pub fn layerdb_dir(&self) -> PathBuf {
        self.root.join(LAYERDB_DIR)
    }

    /// Identity-store directory of a chain id (`sha256:<hex>` or bare hex).
    pub fn layer_meta_dir(&self, chain_id: &str) -> PathBuf {
        let hex = chain_id.strip_prefix("sha256:").unwrap_or(chain_id);
        self.layerdb_dir().join(hex)
    }
}

/// One layer of an image, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayer {
    pub layout: LayerLayout,
    pub identity: LayerIdentity,
}

/// The chain id following `parent` for the layer with `diff_id`.
pub fn chain_id(parent: &str, diff_id: &str) -> String {
    format!("sha256:{}", sha256_hex(format!("{parent} {diff_id}")))
}

/// Chain ids for every layer, bottom first.  The first chain id is the first diff id.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            Some(parent) => chain_id(parent, diff_id),
            None => diff_id.clone(),
        };
        chain.push(next);
    }
    chain
}

/// Layer directory names of the whole mount stack, topmost first.
///
/// Each reported path is `<overlay>/<layer-name>/diff`; the name is the second to last
/// segment.
pub fn layer_names(graph: &GraphDriver) -> Result<Vec<String>> {
    graph
        .layer_dirs()?
        .into_iter()
        .map(|dir| {
            dir.parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::Consistency(format!(
                        "graph driver path {} does not name a layer",
                        dir.display()
                    ))
                })
        })
        .collect()
}

/// The identity-store entries of an image, topmost first.
///
/// Reads nothing but the identity store, so it works while layer directories are
/// unreadable.
pub fn resolve_identities(
    storage: &StorageLayout,
    diff_ids: &[String],
) -> Result<Vec<LayerIdentity>> {
    if diff_ids.is_empty() {
        return Err(Error::Consistency("image has no diff ids".to_string()));
    }
    let mut identities = chain_ids(diff_ids)
        .iter()
        .map(|chain_id| LayerIdentity::read(storage.layer_meta_dir(chain_id)))
        .collect::<Result<Vec<_>>>()?;
    identities.reverse();
    Ok(identities)
}

/// Resolves every layer of an image, topmost first, with its identity-store entry.
///
/// # Errors
///
/// Consistency errors when a chain id has no `cache-id`, when a `cache-id` names a
/// directory that is not part of the mount stack, or when a directory of the stack is
/// never claimed by any chain id.
pub fn resolve_layers(
    storage: &StorageLayout,
    graph: &GraphDriver,
    diff_ids: &[String],
) -> Result<Vec<ResolvedLayer>> {
    if diff_ids.is_empty() {
        return Err(Error::Consistency("image has no diff ids".to_string()));
    }

    let overlay = storage.overlay_dir();
    let mut candidates: Vec<(LayerLayout, Option<LayerIdentity>)> = layer_names(graph)?
        .iter()
        .map(|name| Ok((LayerLayout::read(overlay.join(name))?, None)))
        .collect::<Result<_>>()?;

    for chain_id in chain_ids(diff_ids) {
        let identity = LayerIdentity::read(storage.layer_meta_dir(&chain_id))?;
        let expected = overlay.join(&identity.cache_id);
        debug!("chain {chain_id} resolves to {}", expected.display());

        let Some((_, slot)) = candidates
            .iter_mut()
            .find(|(layout, _)| layout.layer_path() == expected)
        else {
            return Err(Error::Consistency(format!(
                "chain id {chain_id} resolves to {} which is not in the image's mount stack",
                expected.display()
            )));
        };
        *slot = Some(identity);
    }

    candidates
        .into_iter()
        .map(|(layout, identity)| match identity {
            Some(identity) => Ok(ResolvedLayer { layout, identity }),
            None => Err(Error::Consistency(format!(
                "layer {} is not claimed by any diff id",
                layout.layer_path().display()
            ))),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use std::{fs, os::unix::fs::symlink};

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const D0: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const D1: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    /// A two layer image: `a0` at the bottom, `b1` on top.
    fn two_layer_storage(tmp: &Path) -> (StorageLayout, GraphDriver, Vec<String>) {
        let storage = StorageLayout::new(tmp);
        let overlay = storage.overlay_dir();
        fs::create_dir_all(overlay.join("l")).unwrap();
        for (name, link, lower) in [("a0", "LA", None), ("b1", "LB", Some("l/LA"))] {
            fs::create_dir_all(overlay.join(name).join("diff")).unwrap();
            fs::write(overlay.join(name).join("link"), link).unwrap();
            if let Some(lower) = lower {
                fs::write(overlay.join(name).join("lower"), lower).unwrap();
            }
            symlink(format!("../{name}/diff"), overlay.join("l").join(link)).unwrap();
        }

        let diff_ids = vec![D0.to_string(), D1.to_string()];
        for (chain, cache_id) in chain_ids(&diff_ids).iter().zip(["a0", "b1"]) {
            let meta = storage.layer_meta_dir(chain);
            fs::create_dir_all(&meta).unwrap();
            fs::write(meta.join("cache-id"), cache_id).unwrap();
            fs::write(meta.join("size"), "0").unwrap();
        }

        let graph = GraphDriver::overlay(overlay.join("b1/diff"), &[overlay.join("a0/diff")]);
        (storage, graph, diff_ids)
    }

    #[test]
    fn test_chain_ids() {
        let diff_ids = vec![D0.to_string(), D1.to_string(), D0.to_string()];
        let chain = chain_ids(&diff_ids);
        assert_eq!(chain[0], D0);
        assert_eq!(chain[1], chain_id(D0, D1));
        assert_eq!(chain[2], chain_id(&chain[1], D0));
        assert_eq!(
            chain[1],
            format!("sha256:{}", sha256_hex(format!("{D0} {D1}")))
        );
        assert_eq!(chain, chain_ids(&diff_ids));
        assert!(chain_ids(&[]).is_empty());
    }

    #[test]
    fn test_layer_names() {
        let graph = GraphDriver::overlay(
            "/var/lib/docker/overlay2/02bbe403/diff",
            &[
                PathBuf::from("/var/lib/docker/overlay2/b1/diff"),
                PathBuf::from("/var/lib/docker/overlay2/a0/diff"),
            ],
        );
        assert_eq!(layer_names(&graph).unwrap(), ["02bbe403", "b1", "a0"]);

        let graph = GraphDriver::overlay("diff", &[]);
        assert!(layer_names(&graph).unwrap_err().is_consistency());
    }

    #[test]
    fn test_resolve_layers() {
        let tmp = TempDir::new().unwrap();
        let (storage, graph, diff_ids) = two_layer_storage(tmp.path());

        let layers = resolve_layers(&storage, &graph, &diff_ids).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].layout.layer_name(), "b1");
        assert_eq!(layers[0].identity.cache_id, "b1");
        assert_eq!(
            layers[0].identity.meta_path,
            storage.layer_meta_dir(&chain_id(D0, D1))
        );
        assert_eq!(layers[1].layout.layer_name(), "a0");
        assert_eq!(layers[1].identity.meta_path, storage.layer_meta_dir(D0));
        assert_eq!(layers[1].layout.lower_path(), None);
    }

    #[test]
    fn test_resolve_identities() {
        let tmp = TempDir::new().unwrap();
        let (storage, _, diff_ids) = two_layer_storage(tmp.path());
        fs::remove_dir_all(storage.overlay_dir()).unwrap();

        let identities = resolve_identities(&storage, &diff_ids).unwrap();
        let cache_ids: Vec<_> = identities.iter().map(|i| i.cache_id.as_str()).collect();
        assert_eq!(cache_ids, ["b1", "a0"]);
        assert!(resolve_identities(&storage, &[]).unwrap_err().is_consistency());
    }

    #[test]
    fn test_resolve_missing_cache_id() {
        let tmp = TempDir::new().unwrap();
        let (storage, graph, diff_ids) = two_layer_storage(tmp.path());
        fs::remove_file(storage.layer_meta_dir(D0).join("cache-id")).unwrap();

        let err = resolve_layers(&storage, &graph, &diff_ids).unwrap_err();
        assert!(err.is_consistency(), "{err}");
    }

    #[test]
    fn test_resolve_cache_id_outside_stack() {
        let tmp = TempDir::new().unwrap();
        let (storage, graph, diff_ids) = two_layer_storage(tmp.path());
        let meta = storage.layer_meta_dir(&chain_id(D0, D1));
        fs::write(meta.join("cache-id"), "zz").unwrap();

        let err = resolve_layers(&storage, &graph, &diff_ids).unwrap_err();
        assert!(err.is_consistency(), "{err}");
    }

    #[test]
    fn test_resolve_unclaimed_layer() {
        let tmp = TempDir::new().unwrap();
        let (storage, graph, _) = two_layer_storage(tmp.path());

        let err = resolve_layers(&storage, &graph, &[D0.to_string()]).unwrap_err();
        assert!(err.is_consistency(), "{err}");
        assert!(resolve_layers(&storage, &graph, &[]).unwrap_err().is_consistency());
    }
}
