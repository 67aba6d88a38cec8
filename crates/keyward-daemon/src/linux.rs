//! udev listener that forwards block device events to the daemon.

use crate::devices::{BlockAction, BlockEvent};
use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::ffi::OsStr;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use udev::{Device, MonitorBuilder, MonitorSocket};

/// Start the listener on its own thread. Returns once the monitor socket is open,
/// so a missing udev is reported as a startup error.
pub(crate) fn spawn_monitor(events: UnboundedSender<BlockEvent>) -> Result<thread::JoinHandle<()>> {
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let handle = thread::Builder::new()
        .name("keyward-udev".into())
        .spawn(move || {
            let monitor = match open_monitor() {
                Ok(monitor) => {
                    let _ = ready_tx.send(Ok(()));
                    monitor
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            event_loop(monitor, events);
        })
        .context("spawn udev listener thread")?;

    ready_rx
        .recv()
        .map_err(|_| anyhow!("udev listener exited during startup"))?
        .context("create udev monitor")?;
    info!("listening for block device events");
    Ok(handle)
}

fn open_monitor() -> std::io::Result<MonitorSocket> {
    MonitorBuilder::new()?.match_subsystem("block")?.listen()
}

/// Block on udev events until the receiving side goes away.
fn event_loop(monitor: MonitorSocket, events: UnboundedSender<BlockEvent>) {
    loop {
        if let Some(event) = monitor.iter().next() {
            let device = event.device();
            let Some(block) = block_event(&device) else {
                continue;
            };
            debug!(
                "udev {:?} for {} (removable: {})",
                block.action,
                block.devnode.display(),
                block.removable
            );
            if events.send(block).is_err() {
                debug!("device event receiver closed; stopping udev listener");
                return;
            }
        } else {
            thread::sleep(Duration::from_millis(100));
        }
    }
}

fn block_event(device: &Device) -> Option<BlockEvent> {
    let action = match device.action().and_then(os_str_to_str).unwrap_or("change") {
        "add" | "bind" => BlockAction::Added,
        "change" => BlockAction::Changed,
        "remove" | "unbind" => BlockAction::Removed,
        _ => return None,
    };
    let devnode = device.devnode()?.to_path_buf();
    Some(BlockEvent {
        action,
        devnode,
        removable: is_usb_filesystem(device),
    })
}

fn is_usb_filesystem(device: &Device) -> bool {
    device.property_value("ID_BUS").and_then(os_str_to_str) == Some("usb")
        && device.property_value("ID_FS_USAGE").and_then(os_str_to_str) == Some("filesystem")
}

fn os_str_to_str(value: &OsStr) -> Option<&str> {
    value.to_str()
}
