//! Core building blocks shared by the keyward binaries.
//!
//! The presence engine, its configuration, and marker handling live here so the
//! daemon and the CLI only wire up operator surfaces.

pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod marker;
pub mod registry;
pub mod volumes;

pub use classifier::{Classification, Classifier, MarkerClassifier};
pub use config::{
    ConfigFormat, ConfigStore, KeyConfiguration, KeywardConfig, NotificationCfg, SharedConfig,
    WatchCfg,
};
pub use dispatch::{
    CommandLauncher, Direction, DispatchOutcome, Dispatcher, ProcessLauncher, Transition,
};
pub use engine::{DeviceSignal, Engine, EngineEvent, EventSink, LogSink, SignalSource, SignalTarget};
pub use error::{KeywardError, KeywardResult};
pub use identity::{resolve, KeyIdentity, KeyMaterial};
pub use registry::{PresenceEntry, PresenceRegistry};
pub use volumes::{MountPoint, MountTable, VolumeSource};
