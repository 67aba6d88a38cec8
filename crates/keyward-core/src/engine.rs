//! Reconciliation loop: folds notification and poll signals into presence transitions.
//!
//! Neither producer is trusted. A signal only says "look at this mount point again";
//! the classifier is consulted every time and the registry diff decides what, if
//! anything, gets dispatched.

use crate::classifier::{Classification, Classifier};
use crate::dispatch::{Direction, DispatchOutcome, Dispatcher, Transition};
use crate::identity::{resolve, KeyIdentity};
use crate::registry::{PresenceEntry, PresenceRegistry};
use crate::volumes::{MountPoint, VolumeSource};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};

/// Which producer a signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Notification,
    Poll,
}

/// What a signal points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalTarget {
    Mount(MountPoint),
    /// The producer could not map the device to a mount point.
    Unknown(String),
}

/// "Something changed" hint from one of the producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSignal {
    pub direction: Direction,
    pub target: SignalTarget,
    pub source: SignalSource,
}

impl DeviceSignal {
    pub fn notification(direction: Direction, mount: MountPoint) -> Self {
        Self {
            direction,
            target: SignalTarget::Mount(mount),
            source: SignalSource::Notification,
        }
    }

    pub fn unidentified(direction: Direction, detail: impl Into<String>) -> Self {
        Self {
            direction,
            target: SignalTarget::Unknown(detail.into()),
            source: SignalSource::Notification,
        }
    }
}

/// Everything observers may want to surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Transition {
        transition: Transition,
        outcome: DispatchOutcome,
    },
    UnidentifiedDevice {
        direction: Direction,
        detail: String,
    },
    /// A volume was announced but carries no marker.
    NonKeyVolume { mount: MountPoint },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

impl EventSink for mpsc::Sender<EngineEvent> {
    fn publish(&self, event: EngineEvent) {
        if self.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

/// Sink that only writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: EngineEvent) {
        match event {
            EngineEvent::Transition { transition, .. } => debug!(
                "{} {} at {}",
                transition
                    .identity
                    .map(|id| id.to_hex())
                    .unwrap_or_else(|| "unknown key".into()),
                transition.direction,
                transition.mount
            ),
            EngineEvent::UnidentifiedDevice { direction, detail } => {
                debug!("unidentified device {direction}: {detail}")
            }
            EngineEvent::NonKeyVolume { mount } => debug!("{mount} carries no security key"),
        }
    }
}

/// Owns the presence registry and serialises work per mount point.
pub struct Engine {
    classifier: Arc<dyn Classifier>,
    registry: PresenceRegistry,
    dispatcher: Dispatcher,
    sink: Arc<dyn EventSink>,
    mount_locks: Mutex<HashMap<MountPoint, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        dispatcher: Dispatcher,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            classifier,
            registry: PresenceRegistry::new(),
            dispatcher,
            sink,
            mount_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for both producers. Returns the transitions it dispatched.
    pub fn handle(&self, signal: DeviceSignal) -> Vec<Transition> {
        match signal.target {
            SignalTarget::Mount(mount) => {
                let announced = signal.source == SignalSource::Notification
                    && signal.direction == Direction::Arrived;
                self.reconcile_inner(&mount, announced)
            }
            SignalTarget::Unknown(detail) => {
                info!("{} device could not be mapped to a volume: {detail}", signal.direction);
                self.sink.publish(EngineEvent::UnidentifiedDevice {
                    direction: signal.direction,
                    detail,
                });
                Vec::new()
            }
        }
    }

    /// Re-derive the state of `mount` and dispatch whatever changed.
    pub fn reconcile(&self, mount: &MountPoint, source: SignalSource) -> Vec<Transition> {
        debug!("reconciling {mount} ({source:?})");
        self.reconcile_inner(mount, false)
    }

    /// One polling pass: look at every volume that is not registered yet and every
    /// registered volume that has disappeared.
    pub fn poll_once(&self, volumes: &dyn VolumeSource) -> Vec<Transition> {
        let mounted: BTreeSet<MountPoint> = match volumes.removable_mounts() {
            Ok(mounts) => mounts.into_iter().collect(),
            Err(err) => {
                warn!("skipping poll, unable to enumerate volumes: {err}");
                return Vec::new();
            }
        };

        let registered: BTreeSet<MountPoint> = self.registry.mounts().into_iter().collect();
        let mut transitions = Vec::new();
        for mount in mounted.difference(&registered) {
            transitions.extend(self.reconcile(mount, SignalSource::Poll));
        }
        for mount in registered.difference(&mounted) {
            transitions.extend(self.reconcile(mount, SignalSource::Poll));
        }
        transitions
    }

    /// Keys currently believed present, ordered by mount point.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    fn reconcile_inner(&self, mount: &MountPoint, announced: bool) -> Vec<Transition> {
        let slot = self.mount_lock(mount);
        let transitions = {
            let _serial = slot.lock().unwrap_or_else(PoisonError::into_inner);
            self.apply(mount, announced)
        };
        drop(slot);
        self.release_mount_lock(mount);
        transitions
    }

    // Caller holds the per-mount lock.
    fn apply(&self, mount: &MountPoint, announced: bool) -> Vec<Transition> {
        match self.classifier.classify(mount) {
            Classification::ValidKey(material) => {
                let identity = resolve(&material);
                let previous = self.registry.upsert(PresenceEntry {
                    mount: mount.clone(),
                    identity,
                    material,
                });
                match previous {
                    None => vec![self.fire(mount, Direction::Arrived, identity)],
                    Some(previous) if previous.identity == identity => Vec::new(),
                    Some(previous) => {
                        info!("key on {mount} changed from {} to {identity}", previous.identity);
                        vec![
                            self.fire(mount, Direction::Removed, previous.identity),
                            self.fire(mount, Direction::Arrived, identity),
                        ]
                    }
                }
            }
            Classification::NotAKey => match self.registry.remove(mount) {
                Some(previous) => vec![self.fire(mount, Direction::Removed, previous.identity)],
                None => {
                    if announced {
                        self.sink.publish(EngineEvent::NonKeyVolume {
                            mount: mount.clone(),
                        });
                    }
                    Vec::new()
                }
            },
        }
    }

    fn fire(&self, mount: &MountPoint, direction: Direction, identity: KeyIdentity) -> Transition {
        let transition = Transition {
            mount: mount.clone(),
            direction,
            identity: Some(identity),
        };
        let outcome = self.dispatcher.dispatch(&transition);
        self.sink.publish(EngineEvent::Transition {
            transition: transition.clone(),
            outcome,
        });
        transition
    }

    fn mount_lock(&self, mount: &MountPoint) -> Arc<Mutex<()>> {
        self.lock_table()
            .entry(mount.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Slots are only cloned under the table lock, so a strong count of one means
    // nobody is waiting on it.
    fn release_mount_lock(&self, mount: &MountPoint) {
        let mut table = self.lock_table();
        let idle = table
            .get(mount)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle && !self.registry.contains(mount) {
            table.remove(mount);
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<MountPoint, Arc<Mutex<()>>>> {
        self.mount_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
