//! Maps block device events onto the mount points the engine understands.

use keyward_core::dispatch::Direction;
use keyward_core::engine::DeviceSignal;
use keyward_core::error::KeywardResult;
use keyward_core::volumes::{find_mount_point, MountPoint};
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const MOUNT_RETRY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockAction {
    Added,
    Changed,
    Removed,
}

/// Platform-neutral view of one kernel block device event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockEvent {
    pub action: BlockAction,
    pub devnode: PathBuf,
    /// USB-attached and carrying a filesystem.
    pub removable: bool,
}

type MountLookup = dyn Fn(&Path) -> KeywardResult<Option<PathBuf>> + Send + Sync;

/// Remembers which mount point each device node was seen at, so removals (which
/// arrive after the mount is gone) can still be attributed.
pub(crate) struct DeviceMap {
    lookup: Box<MountLookup>,
    mount_wait: Duration,
    known: Mutex<HashMap<PathBuf, MountPoint>>,
}

impl DeviceMap {
    pub(crate) fn new(mount_wait: Duration) -> Self {
        Self::with_lookup(mount_wait, find_mount_point)
    }

    pub(crate) fn with_lookup<F>(mount_wait: Duration, lookup: F) -> Self
    where
        F: Fn(&Path) -> KeywardResult<Option<PathBuf>> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
            mount_wait,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Translate `event` into an engine signal. Blocks up to `mount_wait` on
    /// arrivals while the automounter catches up.
    pub(crate) fn resolve(&self, event: BlockEvent) -> Option<DeviceSignal> {
        let label = event.devnode.display().to_string();
        match event.action {
            BlockAction::Added | BlockAction::Changed => {
                if !event.removable {
                    return None;
                }
                let wait = match event.action {
                    BlockAction::Added => self.mount_wait,
                    _ => Duration::ZERO,
                };
                match self.wait_for_mount(&event.devnode, wait) {
                    Some(path) => {
                        let mount = MountPoint::from(path);
                        self.known().insert(event.devnode, mount.clone());
                        Some(DeviceSignal::notification(Direction::Arrived, mount))
                    }
                    None if event.action == BlockAction::Added => {
                        Some(DeviceSignal::unidentified(Direction::Arrived, label))
                    }
                    None => match self.known().remove(&event.devnode) {
                        // unmounted without being unplugged
                        Some(mount) => Some(DeviceSignal::notification(Direction::Removed, mount)),
                        None => {
                            debug!("{label} changed but is not mounted");
                            None
                        }
                    },
                }
            }
            BlockAction::Removed => match self.known().remove(&event.devnode) {
                Some(mount) => Some(DeviceSignal::notification(Direction::Removed, mount)),
                None if event.removable => {
                    Some(DeviceSignal::unidentified(Direction::Removed, label))
                }
                None => None,
            },
        }
    }

    fn wait_for_mount(&self, devnode: &Path, wait: Duration) -> Option<PathBuf> {
        let deadline = Instant::now() + wait;
        loop {
            match (self.lookup)(devnode) {
                Ok(Some(path)) => return Some(path),
                Ok(None) => {}
                Err(err) => debug!("mount lookup for {} failed: {err}", devnode.display()),
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(MOUNT_RETRY);
        }
    }

    fn known(&self) -> MutexGuard<'_, HashMap<PathBuf, MountPoint>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
