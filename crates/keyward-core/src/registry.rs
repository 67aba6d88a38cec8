//! Authoritative map of mount points to the keys believed present on them.

use crate::identity::{KeyIdentity, KeyMaterial};
use crate::volumes::MountPoint;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A key the engine currently considers inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub mount: MountPoint,
    pub identity: KeyIdentity,
    pub material: KeyMaterial,
}

/// Mutex-guarded registry. Every public operation takes the lock exactly once, so
/// the registry as a whole is linearizable.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: Mutex<BTreeMap<MountPoint, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entry`, returning whatever it replaced for the same mount point.
    pub fn upsert(&self, entry: PresenceEntry) -> Option<PresenceEntry> {
        self.lock().insert(entry.mount.clone(), entry)
    }

    /// Drop the entry for `mount`, returning it when one existed.
    pub fn remove(&self, mount: &MountPoint) -> Option<PresenceEntry> {
        self.lock().remove(mount)
    }

    /// Point-in-time copy ordered by mount point.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, mount: &MountPoint) -> Option<PresenceEntry> {
        self.lock().get(mount).cloned()
    }

    pub fn contains(&self, mount: &MountPoint) -> bool {
        self.lock().contains_key(mount)
    }

    /// Registered mount points, ordered.
    pub fn mounts(&self) -> Vec<MountPoint> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Poisoning is ignored: every mutation is a single BTreeMap call, so the map is
    // never observed half-updated.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<MountPoint, PresenceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::resolve;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn entry(mount: &str, byte: u8) -> PresenceEntry {
        let material = KeyMaterial::new(vec![byte; 32]);
        PresenceEntry {
            mount: MountPoint::from(mount),
            identity: resolve(&material),
            material,
        }
    }

    #[test]
    fn upsert_reports_previous_entry() {
        let registry = PresenceRegistry::new();
        assert!(registry.upsert(entry("/media/a", 1)).is_none());

        let previous = registry.upsert(entry("/media/a", 2)).unwrap();
        assert_eq!(previous, entry("/media/a", 1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&MountPoint::from("/media/a")), Some(entry("/media/a", 2)));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = PresenceRegistry::new();
        registry.upsert(entry("/media/a", 1));
        let mount = MountPoint::from("/media/a");
        assert_eq!(registry.remove(&mount), Some(entry("/media/a", 1)));
        assert_eq!(registry.remove(&mount), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_mount() {
        let registry = PresenceRegistry::new();
        registry.upsert(entry("/media/c", 3));
        registry.upsert(entry("/media/a", 1));
        registry.upsert(entry("/media/b", 2));
        let mounts: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|e| e.mount.to_string())
            .collect();
        assert_eq!(mounts, vec!["/media/a", "/media/b", "/media/c"]);
        assert_eq!(registry.mounts().len(), 3);
    }

    #[test]
    fn concurrent_upserts_and_removes_stay_consistent() {
        let registry = Arc::new(PresenceRegistry::new());
        let workers: Vec<_> = (0..8u8)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mount = format!("/media/key{worker}");
                    for round in 0..200u8 {
                        registry.upsert(entry(&mount, round));
                        if round % 3 == 0 {
                            registry.remove(&MountPoint::from(mount.as_str()));
                        }
                        let snapshot = registry.snapshot();
                        let unique: HashSet<_> = snapshot.iter().map(|e| &e.mount).collect();
                        assert_eq!(unique.len(), snapshot.len());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // round 199 is not a multiple of 3, so every mount ends present
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 8);
        for present in snapshot {
            assert_eq!(present.identity, entry("/media/x", 199).identity);
        }
    }
}
