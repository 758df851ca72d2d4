//! Filtering mounts over shadow layers.
//!
//! Each shadow layer's `diff` directory is covered by a FUSE mount served by the
//! external `debloated_fs` executable.  The mount shows the original layer's
//! content and copies whatever the container actually touches into the shadow
//! layer's `real` directory.  This module builds those invocations, reads the
//! mount table, and takes the mounts down again.

use std::{
    ffi::{OsStr, OsString},
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};
use rustix::mount::{unmount, UnmountFlags};

use crate::{
    config::Config,
    error::{Error, PathContext, Result},
    layer::{OriginalLayer, ShadowLayer},
    util::{retry_with_backoff, run_command, wait_until},
};

/// Filesystem type the filtering mount registers in the mount table.
pub const MOUNT_TYPE: &str = "fuse.debloated_fs";

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Upper bound on mounts stacked on a single mount point.
const MAX_STACKED: usize = 16;

/// One invocation of the filtering-mount executable.  Nothing happens until [`Self::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMount {
    exe: PathBuf,
    mount_point: PathBuf,
    real_dir: PathBuf,
    lower_dir: PathBuf,
    optimize: String,
    silent: bool,
}

impl FilterMount {
    /// Mount over the shadow's `diff`, serving the original's `diff` and recording into
    /// the shadow's `real`.
    pub fn new(exe: impl Into<PathBuf>, original: &OriginalLayer, shadow: &ShadowLayer) -> Self {
        FilterMount {
            exe: exe.into(),
            mount_point: shadow.layout().diff_path().to_path_buf(),
            real_dir: shadow.real_path().to_path_buf(),
            lower_dir: original.layout().diff_path().to_path_buf(),
            optimize: String::new(),
            silent: true,
        }
    }

    pub fn optimize(mut self, optimize: impl Into<String>) -> Self {
        self.optimize = optimize.into();
        self
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// `[-s] --realdir=<real> --lowerdir=<original diff> --optimize=<opt> <shadow diff>`
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if self.silent {
            args.push(OsString::from("-s"));
        }
        for (key, value) in [
            ("--realdir=", self.real_dir.as_os_str()),
            ("--lowerdir=", self.lower_dir.as_os_str()),
            ("--optimize=", OsStr::new(&self.optimize)),
        ] {
            let mut arg = OsString::from(key);
            arg.push(value);
            args.push(arg);
        }
        args.push(self.mount_point.clone().into_os_string());
        args
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(self.args());
        cmd
    }

    /// Starts the filtering mount.
    ///
    /// Returns false without running anything when the mount point is already mounted
    /// with `mount_type`.
    pub fn mount(&self, mount_type: &str) -> Result<bool> {
        if is_mounted_with_type(&self.mount_point, mount_type)? {
            debug!("{} is already mounted", self.mount_point.display());
            return Ok(false);
        }
        run_command(&mut self.command())?;
        Ok(true)
    }
}

/// Pairs up originals and shadows, both topmost first.
pub fn create_mounts(
    config: &Config,
    originals: &[OriginalLayer],
    shadows: &[ShadowLayer],
) -> Vec<FilterMount> {
    originals
        .iter()
        .zip(shadows)
        .map(|(original, shadow)| {
            FilterMount::new(&config.debloated_fs, original, shadow).optimize(&config.optimize)
        })
        .collect()
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

/// Parses `/proc/self/mounts` content.  Malformed lines are skipped.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape(source),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Undoes the kernel's octal escaping of whitespace and backslashes (`\040` and friends).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string(MOUNT_TABLE).at(MOUNT_TABLE)?;
    Ok(parse_mount_table(&content))
}

/// Whether `path` is currently a mount point of type `mount_type`.
pub fn is_mounted_with_type(path: impl AsRef<Path>, mount_type: &str) -> Result<bool> {
    let path = path.as_ref();
    Ok(read_mount_table()?
        .iter()
        .any(|entry| entry.target == path && entry.fstype == mount_type))
}

/// Force-unmounts every `mount_type` mount stacked on `path`.
fn unmount_all(path: &Path, mount_type: &str) -> Result<()> {
    for _ in 0..MAX_STACKED {
        if !is_mounted_with_type(path, mount_type)? {
            return Ok(());
        }
        debug!("unmounting {}", path.display());
        unmount(path, UnmountFlags::FORCE)
            .map_err(io::Error::from)
            .at(path)?;
    }
    Err(Error::Command {
        command: format!("umount {}", path.display()),
        reason: format!("more than {MAX_STACKED} {mount_type} mounts stacked"),
    })
}

/// Takes down the filtering mounts of a whole layer stack.
///
/// Each unmount is retried with backoff; afterwards the mount table is polled until
/// none of `paths` is mounted with the configured type, or the unmount timeout passes.
pub fn unmount_stack(paths: &[&Path], config: &Config) -> Result<()> {
    let mount_type = config.mount_type.as_str();
    for path in paths {
        retry_with_backoff(config.unmount_retries.max(1), config.poll_interval(), || {
            unmount_all(path, mount_type)
        })?;
    }

    wait_until(
        "filter mounts to be released",
        config.unmount_timeout(),
        config.poll_interval(),
        || {
            let table = read_mount_table()?;
            Ok(!table
                .iter()
                .any(|entry| entry.fstype == mount_type && paths.contains(&entry.target.as_path())))
        },
    )?;
    info!("released {} layer mounts", paths.len());
    Ok(())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::layer::{LayerIdentity, LayerLayout};

    const TABLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
overlay /var/lib/docker/overlay2/c2/merged overlay rw,lowerdir=l/A:l/B 0 0
debloated_fs /var/lib/docker/overlay2/shadow_c2/diff fuse.debloated_fs rw,user_id=0 0 0
debloated_fs /mnt/with\\040space fuse.debloated_fs rw 0 0
garbage
";

    #[test]
    fn test_parse_mount_table() {
        let entries = parse_mount_table(TABLE);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[2],
            MountEntry {
                source: "debloated_fs".to_string(),
                target: PathBuf::from("/var/lib/docker/overlay2/shadow_c2/diff"),
                fstype: MOUNT_TYPE.to_string(),
            }
        );
        assert_eq!(entries[3].target, Path::new("/mnt/with space"));
        assert_eq!(unescape("a\\134b\\011c"), "a\\b\tc");
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
    }

    fn layer_pair(tmp: &Path) -> (OriginalLayer, ShadowLayer) {
        let dir = tmp.join("overlay2/a0");
        fs::create_dir_all(dir.join("diff")).unwrap();
        fs::write(dir.join("link"), "LINKA").unwrap();
        let layout = LayerLayout::read(&dir).unwrap();
        let original = OriginalLayer::new(layout, LayerIdentity::default());
        let shadow = original.shadow();
        (original, shadow)
    }

    #[test]
    fn test_filter_mount_args() {
        let tmp = TempDir::new().unwrap();
        let (original, shadow) = layer_pair(tmp.path());
        let overlay = tmp.path().join("overlay2");

        let mount = FilterMount::new("/usr/local/bin/debloated_fs", &original, &shadow);
        let expected: Vec<OsString> = vec![
            "-s".into(),
            format!("--realdir={}", overlay.join("shadow_a0/real").display()).into(),
            format!("--lowerdir={}", overlay.join("a0/diff").display()).into(),
            "--optimize=".into(),
            overlay.join("shadow_a0/diff").into_os_string(),
        ];
        assert_eq!(mount.args(), expected);
        assert_eq!(mount.mount_point(), overlay.join("shadow_a0/diff"));

        let mount = mount.optimize("2");
        assert_eq!(mount.args()[3], OsString::from("--optimize=2"));
        assert!(mount.command().get_program() == "/usr/local/bin/debloated_fs");
    }

    #[test]
    fn test_create_mounts_pairs_layers() {
        let tmp = TempDir::new().unwrap();
        let (original, shadow) = layer_pair(tmp.path());
        let config = Config {
            debloated_fs: PathBuf::from("/opt/debloated_fs"),
            ..Config::default()
        };
        let mounts = create_mounts(&config, &[original.clone()], &[shadow.clone()]);
        assert_eq!(
            mounts,
            [FilterMount::new("/opt/debloated_fs", &original, &shadow)]
        );
    }

    #[test]
    fn test_mount_runs_executable() {
        let tmp = TempDir::new().unwrap();
        let (original, shadow) = layer_pair(tmp.path());
        // `true` accepts any arguments and mounts nothing
        let mount = FilterMount::new("true", &original, &shadow);
        assert!(mount.mount(MOUNT_TYPE).unwrap());
        assert!(!is_mounted_with_type(mount.mount_point(), MOUNT_TYPE).unwrap());

        let failing = FilterMount::new("false", &original, &shadow);
        assert!(matches!(
            failing.mount(MOUNT_TYPE),
            Err(Error::Command { .. })
        ));
    }

    #[test]
    fn test_unmount_stack_without_mounts() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            unmount_timeout_secs: 0,
            poll_interval_ms: 0,
            ..Config::default()
        };
        let path = tmp.path().join("diff");
        unmount_stack(&[path.as_path()], &config).unwrap();
    }
}
