use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::bus::{Bus, Component, Event};
use crate::config::types::DriveType;
use crate::qmp::QmpHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Empty,
    File(PathBuf),
}

/// Drives a per-CD-ROM-drive tray state machine: opening the tray is
/// requested, and only once QEMU confirms the tray actually opened
/// (`TrayMovedEvent{open: true}`) is the medium swapped or removed. This
/// avoids issuing `blockdev-change-medium` against a drive whose tray QEMU
/// hasn't finished moving.
pub struct MediaController {
    qmp: QmpHandle,
    pending: Mutex<HashMap<String, Target>>,
}

impl MediaController {
    pub fn new(qmp: QmpHandle) -> Self {
        Self {
            qmp,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Component for MediaController {
    fn name(&self) -> &'static str {
        "media-controller"
    }

    async fn handle(&self, event: &Event, bus: &Bus) {
        match event {
            Event::Configure { config, initial } => {
                let cdroms: Vec<_> = config
                    .vm
                    .drives
                    .iter()
                    .filter(|d| d.drive_type == DriveType::Cdrom)
                    .collect();

                if *initial {
                    // QEMU's own argv already mounted whatever file each
                    // drive started with; just record it as current so a
                    // later Configure diffs against reality instead of
                    // against an empty map.
                    let mut pending = self.pending.lock().await;
                    for drive in &cdroms {
                        let target = match &drive.file {
                            Some(file) => Target::File(file.clone()),
                            None => Target::Empty,
                        };
                        pending.insert(drive.device.clone(), target);
                    }
                    drop(pending);
                    bus.publish(Event::ControllerConverged("media"));
                    return;
                }

                let Some(client) = self.qmp.read().await.clone() else {
                    return;
                };
                for drive in &cdroms {
                    let target = match &drive.file {
                        Some(file) => Target::File(file.clone()),
                        None => Target::Empty,
                    };
                    let mut pending = self.pending.lock().await;
                    if pending.get(&drive.device) == Some(&target) {
                        continue;
                    }
                    pending.insert(drive.device.clone(), target);
                    drop(pending);
                    if let Err(source) = client.blockdev_open_tray(&drive.device).await {
                        warn!(device = %drive.device, error = %source, "blockdev-open-tray failed");
                    }
                }
                bus.publish(Event::ControllerConverged("media"));
            }
            Event::TrayMovedEvent { device, open: true } => {
                let target = {
                    let pending = self.pending.lock().await;
                    pending.get(device).cloned()
                };
                let Some(target) = target else {
                    return;
                };
                let Some(client) = self.qmp.read().await.clone() else {
                    return;
                };
                let result = match &target {
                    Target::Empty => client.blockdev_remove_medium(device).await,
                    Target::File(path) => {
                        client
                            .blockdev_change_medium(device, &path.to_string_lossy())
                            .await
                    }
                };
                if let Err(source) = result {
                    warn!(device = %device, error = %source, "CD-ROM medium change failed");
                }
            }
            _ => {}
        }
    }
}
