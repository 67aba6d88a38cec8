//! Marker file I/O: bounded reads, attribute locking, and forging new keys.

use crate::error::{KeywardError, KeywardResult};
use crate::identity::{resolve, KeyIdentity, KeyMaterial};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Size of freshly forged marker files.
pub const DEFAULT_MARKER_LEN: usize = 512;

/// Read the whole marker at `path`, refusing files above `max_bytes` or empty ones.
pub fn read_marker(path: &Path, max_bytes: u64) -> KeywardResult<KeyMaterial> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(marker_error(path, "marker is not a regular file"));
    }
    let declared = metadata.len();
    if declared > max_bytes {
        return Err(marker_error(
            path,
            format!("marker is {declared} bytes, limit is {max_bytes}"),
        ));
    }

    let mut buffer = Zeroizing::new(Vec::with_capacity(declared as usize));
    file.take(max_bytes + 1).read_to_end(&mut buffer)?;
    if buffer.len() as u64 > max_bytes {
        return Err(marker_error(path, "marker grew past the size limit while reading"));
    }
    if buffer.is_empty() {
        return Err(marker_error(path, "marker is empty"));
    }
    Ok(KeyMaterial::new(std::mem::take(&mut *buffer)))
}

/// Like [`read_marker`], but gives up after `timeout`.
pub fn read_marker_bounded(
    path: &Path,
    max_bytes: u64,
    timeout: Duration,
) -> KeywardResult<KeyMaterial> {
    let owned = path.to_path_buf();
    run_bounded(path, timeout, move || read_marker(&owned, max_bytes))
}

/// Run `work` on a helper thread and wait at most `timeout` for its result.
///
/// Media that hangs leaves the helper blocked until the kernel gives up, while
/// the caller moves on. `path` only labels the error.
pub fn run_bounded<T, F>(path: &Path, timeout: Duration, work: F) -> KeywardResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> KeywardResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("marker-read".into())
        .spawn(move || {
            let _ = tx.send(work());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(marker_error(
            path,
            format!("read timed out after {timeout:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => {
            Err(marker_error(path, "reader thread exited without a result"))
        }
    }
}

/// Mark the file read-only so casual edits on the token do not change its identity.
pub fn lock_marker(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if perms.readonly() {
        return Ok(());
    }
    #[cfg(unix)]
    perms.set_mode(perms.mode() & !0o222);
    #[cfg(not(unix))]
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

/// Undo [`lock_marker`] so the file can be replaced.
pub fn unlock_marker(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    if !perms.readonly() {
        return Ok(());
    }
    #[cfg(unix)]
    perms.set_mode(perms.mode() | 0o200);
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}

/// Result of writing a new marker to a volume.
#[derive(Debug, Clone)]
pub struct ForgedMarker {
    pub path: PathBuf,
    pub identity: KeyIdentity,
    pub replaced: bool,
}

/// Write `len` random bytes as the marker under `mount`.
///
/// An existing marker is only replaced when `overwrite` is set; it is unlocked
/// first and the new file is locked again afterwards.
pub fn forge_marker(
    mount: &Path,
    marker_file: &Path,
    len: usize,
    overwrite: bool,
) -> KeywardResult<ForgedMarker> {
    if !mount.is_dir() {
        return Err(marker_error(mount, "volume root is not a directory"));
    }
    if len == 0 {
        return Err(marker_error(mount, "marker length must be greater than 0"));
    }

    let path = mount.join(marker_file);
    let replaced = path.exists();
    if replaced {
        if !overwrite {
            return Err(marker_error(
                &path,
                "a key is already present on this volume; pass overwrite to replace it",
            ));
        }
        unlock_marker(&path)?;
    }

    let mut material = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut material);
    write_marker(&path, &material)?;
    if let Err(err) = lock_marker(&path) {
        debug!("could not lock marker {}: {err}", path.display());
    }

    Ok(ForgedMarker {
        identity: resolve(&KeyMaterial::new(material.to_vec())),
        path,
        replaced,
    })
}

/// Atomically replace `path` with `bytes` via a sibling temp file.
pub fn write_marker(path: &Path, bytes: &[u8]) -> KeywardResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(bytes)?;
    temp.as_file_mut().flush()?;
    let _ = temp.as_file().sync_all();
    temp.persist(path).map_err(|err| KeywardError::Io(err.error))?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

fn sync_parent_dir(dir: &Path) -> io::Result<()> {
    File::open(dir).and_then(|file| file.sync_all())
}

fn marker_error(path: &Path, reason: impl Into<String>) -> KeywardError {
    KeywardError::Marker {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
