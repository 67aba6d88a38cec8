//! Decides whether a mount point currently carries a security key.

use crate::config::WatchCfg;
use crate::error::KeywardResult;
use crate::identity::KeyMaterial;
use crate::marker::{lock_marker, read_marker, run_bounded};
use crate::volumes::{MountPoint, VolumeSource};
use log::debug;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Verdict for one mount point at one moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NotAKey,
    ValidKey(KeyMaterial),
}

/// Re-derives ground truth for a mount point. Must never fail: anything that goes
/// wrong while looking is reported as [`Classification::NotAKey`].
pub trait Classifier: Send + Sync {
    fn classify(&self, mount: &MountPoint) -> Classification;
}

type PendingSet = Arc<Mutex<HashSet<MountPoint>>>;

/// Filesystem classifier: volume mounted, marker present, marker readable in time.
///
/// Every filesystem access for a mount runs on one time-limited helper thread.
/// A mount whose previous helper is still stuck is reported as `NotAKey`
/// without starting another one.
pub struct MarkerClassifier {
    volumes: Arc<dyn VolumeSource>,
    marker_file: PathBuf,
    max_bytes: u64,
    read_timeout: Duration,
    pending: PendingSet,
}

impl MarkerClassifier {
    pub fn new(
        volumes: Arc<dyn VolumeSource>,
        marker_file: impl Into<PathBuf>,
        max_bytes: u64,
        read_timeout: Duration,
    ) -> Self {
        Self {
            volumes,
            marker_file: marker_file.into(),
            max_bytes,
            read_timeout,
            pending: Arc::default(),
        }
    }

    pub fn from_config(volumes: Arc<dyn VolumeSource>, watch: &WatchCfg) -> Self {
        Self::new(
            volumes,
            watch.marker_file.trim(),
            watch.max_marker_bytes,
            watch.read_timeout(),
        )
    }

    /// Where the marker would live on `mount`.
    pub fn marker_path(&self, mount: &MountPoint) -> PathBuf {
        mount.path().join(&self.marker_file)
    }

    /// Number of mounts whose last check has not finished yet.
    pub fn pending_reads(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

impl Classifier for MarkerClassifier {
    fn classify(&self, mount: &MountPoint) -> Classification {
        match self.volumes.is_mounted(mount) {
            Ok(true) => {}
            Ok(false) => {
                debug!("{mount} is not mounted");
                return Classification::NotAKey;
            }
            // The volume itself is the authority when the table cannot be read.
            Err(err) => debug!("cannot enumerate volumes ({err}); inspecting {mount} directly"),
        }

        let Some(claim) = PendingRead::claim(&self.pending, mount) else {
            debug!("earlier read on {mount} has not returned; treating it as absent");
            return Classification::NotAKey;
        };

        let root = mount.path().to_path_buf();
        let marker = self.marker_path(mount);
        let worker_marker = marker.clone();
        let max_bytes = self.max_bytes;
        let result = run_bounded(&marker, self.read_timeout, move || {
            let _claim = claim;
            inspect_volume(&root, &worker_marker, max_bytes)
        });

        match result {
            Ok(Some(material)) => Classification::ValidKey(material),
            Ok(None) => Classification::NotAKey,
            Err(err) => {
                debug!("treating {mount} as absent: {err}");
                Classification::NotAKey
            }
        }
    }
}

// Runs on the helper thread. `None` means there is nothing to read.
fn inspect_volume(
    root: &Path,
    marker: &Path,
    max_bytes: u64,
) -> KeywardResult<Option<KeyMaterial>> {
    if !root.is_dir() {
        debug!("{} is not a directory", root.display());
        return Ok(None);
    }
    match fs::metadata(marker) {
        Ok(meta) if !meta.is_dir() => {}
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("no marker at {}", marker.display());
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    }

    let material = read_marker(marker, max_bytes)?;
    if let Err(err) = lock_marker(marker) {
        debug!("could not lock marker {}: {err}", marker.display());
    }
    Ok(Some(material))
}

/// Marks a mount as busy until the helper thread holding it finishes.
struct PendingRead {
    pending: PendingSet,
    mount: MountPoint,
}

impl PendingRead {
    fn claim(pending: &PendingSet, mount: &MountPoint) -> Option<Self> {
        if !lock_pending(pending).insert(mount.clone()) {
            return None;
        }
        Some(Self {
            pending: pending.clone(),
            mount: mount.clone(),
        })
    }
}

impl Drop for PendingRead {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.mount);
    }
}

fn lock_pending(pending: &PendingSet) -> MutexGuard<'_, HashSet<MountPoint>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeywardError;
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    struct FixedVolumes(Mutex<Vec<MountPoint>>);

    impl VolumeSource for FixedVolumes {
        fn removable_mounts(&self) -> KeywardResult<Vec<MountPoint>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct UnreadableTable;

    impl VolumeSource for UnreadableTable {
        fn removable_mounts(&self) -> KeywardResult<Vec<MountPoint>> {
            Err(KeywardError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )))
        }
    }

    fn classifier_for(mounts: Vec<MountPoint>) -> MarkerClassifier {
        MarkerClassifier::new(
            Arc::new(FixedVolumes(Mutex::new(mounts))),
            "security_key.dat",
            4096,
            Duration::from_secs(2),
        )
    }

    #[test]
    fn valid_key_when_mounted_with_marker() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        fs::write(dir.path().join("security_key.dat"), [0x01u8; 512]).unwrap();

        let classifier = classifier_for(vec![mount.clone()]);
        match classifier.classify(&mount) {
            Classification::ValidKey(material) => assert_eq!(material.len(), 512),
            other => panic!("unexpected classification: {other:?}"),
        }
        let marker = classifier.marker_path(&mount);
        assert!(fs::metadata(marker).unwrap().permissions().readonly());
    }

    #[test]
    fn missing_marker_is_not_a_key() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        let classifier = classifier_for(vec![mount.clone()]);
        assert_eq!(classifier.classify(&mount), Classification::NotAKey);
    }

    #[test]
    fn unmounted_volume_is_not_a_key_even_with_marker() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        fs::write(dir.path().join("security_key.dat"), b"key").unwrap();
        let classifier = classifier_for(Vec::new());
        assert_eq!(classifier.classify(&mount), Classification::NotAKey);
    }

    #[test]
    fn oversized_marker_is_not_a_key() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        fs::write(dir.path().join("security_key.dat"), vec![0u8; 8192]).unwrap();
        let classifier = classifier_for(vec![mount.clone()]);
        assert_eq!(classifier.classify(&mount), Classification::NotAKey);
    }

    #[test]
    fn unreadable_mount_table_falls_back_to_the_volume_itself() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        let classifier = MarkerClassifier::new(
            Arc::new(UnreadableTable),
            "security_key.dat",
            4096,
            Duration::from_secs(2),
        );
        assert_eq!(classifier.classify(&mount), Classification::NotAKey);

        fs::write(dir.path().join("security_key.dat"), [0x07u8; 32]).unwrap();
        assert!(matches!(
            classifier.classify(&mount),
            Classification::ValidKey(_)
        ));
    }

    #[test]
    fn finished_reads_release_their_mount() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        fs::write(dir.path().join("security_key.dat"), b"key").unwrap();
        let classifier = classifier_for(vec![mount.clone()]);
        for _ in 0..3 {
            assert!(matches!(
                classifier.classify(&mount),
                Classification::ValidKey(_)
            ));
        }
        assert_eq!(classifier.pending_reads(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn hanging_marker_is_not_a_key_and_keeps_one_reader() {
        let dir = tempdir().unwrap();
        let mount = MountPoint::new(dir.path());
        let marker = dir.path().join("security_key.dat");
        let status = std::process::Command::new("mkfifo")
            .arg(&marker)
            .status()
            .unwrap();
        assert!(status.success());

        let classifier = MarkerClassifier::new(
            Arc::new(FixedVolumes(Mutex::new(vec![mount.clone()]))),
            "security_key.dat",
            4096,
            Duration::from_millis(100),
        );

        let started = Instant::now();
        assert_eq!(classifier.classify(&mount), Classification::NotAKey);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(classifier.pending_reads(), 1);

        for _ in 0..5 {
            assert_eq!(classifier.classify(&mount), Classification::NotAKey);
        }
        assert_eq!(classifier.pending_reads(), 1);

        // Unblock the stuck reader; it sees a non-regular file and gives up.
        drop(fs::OpenOptions::new().write(true).open(&marker).unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        while classifier.pending_reads() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(classifier.pending_reads(), 0);

        fs::remove_file(&marker).unwrap();
        assert_eq!(classifier.classify(&mount), Classification::NotAKey);
        assert_eq!(classifier.pending_reads(), 0);
    }
}
