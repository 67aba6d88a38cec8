//! Event reporter: drains engine events, logs them, and mirrors key activity to
//! the desktop when notifications are enabled.

use keyward_core::config::SharedConfig;
use keyward_core::dispatch::{spawn_detached, Direction, DispatchOutcome};
use keyward_core::engine::EngineEvent;
use log::{info, warn};
use std::io;
use std::sync::{mpsc, Arc};
use std::thread;

/// Consume `events` on a dedicated thread until every sender is dropped.
pub(crate) fn spawn_reporter(
    events: mpsc::Receiver<EngineEvent>,
    config: Arc<SharedConfig>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("keyward-events".into())
        .spawn(move || {
            for event in events {
                report(&event, &config);
            }
        })
}

/// Tell the user the watcher is running.
pub(crate) fn announce_startup(config: &SharedConfig) {
    notify(config, "Security Key Manager", "Watching for security keys");
}

fn report(event: &EngineEvent, config: &SharedConfig) {
    match event {
        EngineEvent::Transition {
            transition,
            outcome: DispatchOutcome::NoCommand { key_name },
        } => info!(
            "security key {key_name} {} at {} but no action configured",
            transition.direction, transition.mount
        ),
        EngineEvent::Transition {
            transition,
            outcome: DispatchOutcome::Failed { key_name, error, .. },
        } => warn!(
            "security key {key_name} {} at {} but its command failed: {error}",
            transition.direction, transition.mount
        ),
        EngineEvent::NonKeyVolume { mount } => info!("no security key found on {mount}"),
        _ => {}
    }

    if let Some((title, body)) = describe(event) {
        notify(config, title, &body);
    }
}

/// Desktop message for `event`, if it warrants one.
pub(crate) fn describe(event: &EngineEvent) -> Option<(&'static str, String)> {
    match event {
        EngineEvent::Transition {
            transition,
            outcome: DispatchOutcome::Failed { key_name, error, .. },
        } => Some((
            "Security Key Action Failed",
            format!(
                "Could not run the {} command for {key_name}: {error}",
                action_label(transition.direction)
            ),
        )),
        EngineEvent::Transition { transition, .. } => match transition.direction {
            Direction::Arrived => Some((
                "Security Key Detected",
                format!("Security key plugged in: {}", transition.mount),
            )),
            Direction::Removed => Some((
                "Security Key Removed",
                format!("Security key unplugged from {}", transition.mount),
            )),
        },
        EngineEvent::UnidentifiedDevice { direction, detail } => Some((
            "Security Key",
            format!("Unknown device {direction} ({detail})"),
        )),
        EngineEvent::NonKeyVolume { .. } => None,
    }
}

fn action_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Arrived => "plug-in",
        Direction::Removed => "unplug",
    }
}

fn notify(config: &SharedConfig, title: &str, body: &str) {
    let settings = config.current().notifications;
    let command = settings.command.trim();
    if !settings.enabled || command.is_empty() {
        return;
    }
    if let Err(err) = spawn_detached(command, [title, body]) {
        warn!("desktop notification failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::config::KeywardConfig;
    use keyward_core::dispatch::Transition;
    use keyward_core::volumes::MountPoint;

    fn transition(direction: Direction) -> EngineEvent {
        EngineEvent::Transition {
            transition: Transition {
                mount: MountPoint::from("/media/alice/KEY"),
                direction,
                identity: None,
            },
            outcome: DispatchOutcome::NoConfiguration,
        }
    }

    #[test]
    fn describe_covers_arrival_removal_and_unknown_devices() {
        let (title, body) = describe(&transition(Direction::Arrived)).unwrap();
        assert_eq!(title, "Security Key Detected");
        assert_eq!(body, "Security key plugged in: /media/alice/KEY");

        let (title, body) = describe(&transition(Direction::Removed)).unwrap();
        assert_eq!(title, "Security Key Removed");
        assert!(body.ends_with("/media/alice/KEY"));

        let unknown = EngineEvent::UnidentifiedDevice {
            direction: Direction::Removed,
            detail: "/dev/sdc1".into(),
        };
        assert_eq!(
            describe(&unknown).unwrap().1,
            "Unknown device removed (/dev/sdc1)"
        );

        let plain = EngineEvent::NonKeyVolume {
            mount: MountPoint::from("/media/USB"),
        };
        assert!(describe(&plain).is_none());
    }

    #[test]
    fn failed_command_gets_its_own_message() {
        let failed = EngineEvent::Transition {
            transition: Transition {
                mount: MountPoint::from("/media/alice/KEY"),
                direction: Direction::Removed,
                identity: None,
            },
            outcome: DispatchOutcome::Failed {
                key_name: "Office".into(),
                command: "lock-sessions".into(),
                error: "No such file or directory".into(),
            },
        };
        let (title, body) = describe(&failed).unwrap();
        assert_eq!(title, "Security Key Action Failed");
        assert_eq!(
            body,
            "Could not run the unplug command for Office: No such file or directory"
        );
    }

    #[test]
    fn reporter_drains_until_senders_drop() {
        let mut cfg = KeywardConfig::default();
        cfg.notifications.enabled = false;
        let config = Arc::new(SharedConfig::new(cfg));

        let (tx, rx) = mpsc::channel();
        let handle = spawn_reporter(rx, config).unwrap();
        tx.send(transition(Direction::Arrived)).unwrap();
        tx.send(transition(Direction::Removed)).unwrap();
        drop(tx);
        handle.join().unwrap();
    }
}
