use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::bus::{Bus, Component, Event};
use crate::qmp::QmpHandle;

/// Reconciles the guest's balloon target towards `vm.currentRam` via QMP
/// `balloon`. QEMU reports the actual post-balloon size asynchronously
/// through `query-balloon`-shaped `BALLOON_CHANGE` events, which the QMP
/// client demultiplexes like any other async event; this controller simply
/// issues the target and lets the observed size flow back as `ObserveRam`.
pub struct RamController {
    qmp: QmpHandle,
    last_requested: Mutex<Option<u64>>,
}

impl RamController {
    pub fn new(qmp: QmpHandle) -> Self {
        Self {
            qmp,
            last_requested: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for RamController {
    fn name(&self) -> &'static str {
        "ram-controller"
    }

    async fn handle(&self, event: &Event, bus: &Bus) {
        match event {
            Event::Configure { config, .. } => {
                let target = config.vm.current_ram;
                let mut last = self.last_requested.lock().await;
                if *last != Some(target) {
                    let Some(client) = self.qmp.read().await.clone() else {
                        return;
                    };
                    if let Err(source) = client.balloon(target).await {
                        warn!(error = %source, "balloon request failed");
                        return;
                    }
                    *last = Some(target);
                    bus.publish(Event::ObserveRam(target));
                }
                drop(last);
                // No confirmation is awaited for the balloon request; the
                // request having been issued (or already matching) is
                // convergence for this controller.
                bus.publish(Event::ControllerConverged("ram"));
            }
            Event::MonitorResult(result) if result.command == "balloon" && !result.successful => {
                warn!(error = ?result.error_message, "balloon command rejected by QEMU");
            }
            _ => {}
        }
    }
}
