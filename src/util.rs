use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::Path,
    process::Command,
    thread,
    time::{Duration, Instant},
};

use log::debug;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, PathContext, Result};

/// Checks whether anything exists at `path`, without following a final symlink.
///
/// A dangling `l/<link-id>` symlink still counts as existing.
pub fn path_exists(path: impl AsRef<Path>) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Sum of the sizes of every non-directory entry below `path`.
pub fn dir_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let mut size = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|err| Error::Io {
            path: err.path().unwrap_or(path).to_path_buf(),
            source: io::Error::from(err),
        })?;
        if !entry.file_type().is_dir() {
            size += entry.metadata().map_err(io::Error::from).at(entry.path())?.len();
        }
    }
    Ok(size)
}

pub fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    fs::copy(src.as_ref(), dst.as_ref()).at(src)?;
    Ok(())
}

/// Renames `src` to `dst`.  Works for both files and directories, but only within one
/// filesystem.
pub fn move_path(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    fs::rename(src.as_ref(), dst.as_ref()).at(src)
}

/// Hex-encoded sha256 of the file contents.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).at(path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex-encoded sha256 of an in-memory string.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Archives the contents of `src` into a new tar file at `dest`.
///
/// Entry names are relative to `src` and the root itself is not recorded.  Symlinks are
/// stored as symlinks, device nodes (overlay whiteouts) as device nodes.
pub fn tar_dir(src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let (src, dest) = (src.as_ref(), dest.as_ref());
    debug!("archiving {} into {}", src.display(), dest.display());

    let file = File::create(dest).at(dest)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);
    builder.append_dir_all("", src).at(src)?;
    let mut out = builder.into_inner().at(dest)?;
    out.flush().at(dest)
}

/// Unpacks the tar file at `archive` into the existing directory `dest`.
pub fn untar(archive: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    let (archive, dest) = (archive.as_ref(), dest.as_ref());
    debug!("extracting {} into {}", archive.display(), dest.display());

    let file = File::open(archive).at(archive)?;
    let mut tar = tar::Archive::new(BufReader::new(file));
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest).at(archive)
}

/// Runs a command to completion and returns its stdout.
///
/// A non-zero exit status is an error carrying the trimmed stderr.
pub fn run_command(cmd: &mut Command) -> Result<Vec<u8>> {
    debug!("running {cmd:?}");
    let command = format!("{cmd:?}");
    let output = cmd.output().map_err(|err| Error::Command {
        command: command.clone(),
        reason: err.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Command {
            command,
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(output.stdout)
}

/// Polls `probe` every `interval` until it returns true.
///
/// Fails with [`Error::Timeout`] once `timeout` has elapsed.  The probe always runs at least
/// once, so a zero timeout is a single check.
pub fn wait_until(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: impl FnMut() -> Result<bool>,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if probe()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(timeout, what.to_string()));
        }
        thread::sleep(interval);
    }
}

/// Runs `op` up to `attempts` times, doubling the delay between attempts.
///
/// The error of the last attempt is returned.
pub fn retry_with_backoff<T>(
    attempts: u32,
    initial_delay: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!("attempt {attempt}/{attempts} failed: {err}; retrying in {delay:?}");
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
        }
    }
}
