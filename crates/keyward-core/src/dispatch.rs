//! Turns confirmed transitions into fire-and-forget command launches.

use crate::config::{ConfigStore, KeyConfiguration, IDENTITY_PLACEHOLDER};
use crate::error::{KeywardError, KeywardResult};
use crate::identity::KeyIdentity;
use crate::volumes::MountPoint;
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

/// Which way a key moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Arrived,
    Removed,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Arrived => f.write_str("arrived"),
            Direction::Removed => f.write_str("removed"),
        }
    }
}

/// A confirmed presence change, produced by the engine and consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub mount: MountPoint,
    pub direction: Direction,
    pub identity: Option<KeyIdentity>,
}

/// What happened when a transition was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Launched {
        key_name: String,
        command: String,
        pid: u32,
    },
    /// The identity is registered but has no command for this direction.
    NoCommand { key_name: String },
    /// No configuration entry matches the identity.
    NoConfiguration,
    Failed {
        key_name: String,
        command: String,
        error: String,
    },
}

/// Launches a command line without waiting for it.
pub trait CommandLauncher: Send + Sync {
    /// Start `command_line` detached and return its process id.
    fn launch(&self, command_line: &str) -> KeywardResult<u32>;
}

/// Launcher backed by `std::process`.
///
/// The executable is everything before the first whitespace and the remainder is
/// split on whitespace into arguments. Quoting is not interpreted, so executable
/// paths containing spaces cannot be expressed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl CommandLauncher for ProcessLauncher {
    fn launch(&self, command_line: &str) -> KeywardResult<u32> {
        let (program, args) = split_command(command_line)
            .ok_or_else(|| KeywardError::Launch("command line is empty".into()))?;
        spawn_detached(program, args)
    }
}

/// Spawn `program` with inherited stdout/stderr and reap it in the background.
pub fn spawn_detached<I, S>(program: &str, args: I) -> KeywardResult<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|err| KeywardError::Launch(format!("{program}: {err}")))?;
    let pid = child.id();

    let label = program.to_string();
    let reaper = thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!("{label} (pid {pid}) exited with {status}"),
            Err(err) => debug!("failed to wait for {label} (pid {pid}): {err}"),
        });
    if let Err(err) = reaper {
        warn!("unable to start reaper for pid {pid}: {err}");
    }

    Ok(pid)
}

/// Split a command line at its first whitespace boundary.
///
/// Returns `None` for blank input.
pub fn split_command(command_line: &str) -> Option<(&str, Vec<&str>)> {
    let trimmed = command_line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once(char::is_whitespace) {
        Some((program, rest)) => Some((program, rest.split_whitespace().collect())),
        None => Some((trimmed, Vec::new())),
    }
}

/// Substitute every placeholder in `template` with the hex identity.
pub fn render_command(template: &str, identity: &KeyIdentity) -> String {
    template.replace(IDENTITY_PLACEHOLDER, &identity.to_hex())
}

/// Looks up the configured action for a transition and launches it.
pub struct Dispatcher {
    config: Arc<dyn ConfigStore>,
    launcher: Arc<dyn CommandLauncher>,
}

impl Dispatcher {
    pub fn new(config: Arc<dyn ConfigStore>, launcher: Arc<dyn CommandLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Resolve and launch the action for `transition`. Never fails; problems are
    /// folded into the returned outcome.
    pub fn dispatch(&self, transition: &Transition) -> DispatchOutcome {
        let Some(identity) = transition.identity else {
            return DispatchOutcome::NoConfiguration;
        };

        let Some(key) = self.config.find_by_identity(&identity.to_hex()) else {
            info!(
                "security key {identity} {} at {} but no configuration matches",
                transition.direction, transition.mount
            );
            return DispatchOutcome::NoConfiguration;
        };

        let template = template_for(&key, transition.direction);
        if template.trim().is_empty() {
            info!(
                "security key {} {} at {} but no action configured",
                key.name, transition.direction, transition.mount
            );
            return DispatchOutcome::NoCommand { key_name: key.name };
        }

        let command = render_command(template, &identity);
        match self.launcher.launch(&command) {
            Ok(pid) => {
                info!(
                    "security key {} {} at {}; launched pid {pid}",
                    key.name, transition.direction, transition.mount
                );
                DispatchOutcome::Launched {
                    key_name: key.name,
                    command,
                    pid,
                }
            }
            Err(err) => {
                warn!("failed to execute command for key {}: {err}", key.name);
                DispatchOutcome::Failed {
                    key_name: key.name,
                    command,
                    error: err.to_string(),
                }
            }
        }
    }
}

fn template_for(key: &KeyConfiguration, direction: Direction) -> &str {
    match direction {
        Direction::Arrived => &key.command_on_arrival,
        Direction::Removed => &key.command_on_removal,
    }
}
