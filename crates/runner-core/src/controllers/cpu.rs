use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::{Bus, Component, Event};
use crate::qmp::{Command, QmpHandle};

/// `qom-path` prefix of hotpluggable, user-removable CPU slots. Slots
/// outside this prefix are board-fixed CPUs QEMU will reject `device_del`
/// against.
const REMOVABLE_CPU_PREFIX: &str = "/machine/peripheral/cpu-";

/// Reconciles the guest's online CPU count towards `vm.currentCpus` using
/// QEMU's hotpluggable-CPU machinery: `query-hotpluggable-cpus` returns the
/// full set of CPU slots the machine type allows (some already realized,
/// some not); unrealized slots are brought up with `device_add`, realized
/// ones beyond the target are torn down with `device_del`.
pub struct CpuController {
    qmp: QmpHandle,
    desired: Mutex<Option<u32>>,
    online: AtomicU32,
}

impl CpuController {
    pub fn new(qmp: QmpHandle) -> Self {
        Self {
            qmp,
            desired: Mutex::new(None),
            online: AtomicU32::new(0),
        }
    }

    async fn reconcile(&self, bus: &Bus) {
        let Some(target) = *self.desired.lock().await else {
            return;
        };
        let Some(client) = self.qmp.read().await.clone() else {
            return;
        };
        debug!(target, "reconciling CPU count");
        if let Err(source) = client.query_hotpluggable_cpus().await {
            warn!(error = %source, "query-hotpluggable-cpus failed");
            return;
        }
        let _ = bus;
    }

    async fn handle_hotpluggable_cpus(&self, client: &Arc<crate::qmp::QmpClient>, result: &Value, bus: &Bus) {
        let Some(target) = *self.desired.lock().await else {
            return;
        };
        let Some(slots) = result.as_array() else {
            return;
        };

        let realized: Vec<&Value> = slots
            .iter()
            .filter(|s| s.get("qom-path").and_then(Value::as_str).is_some())
            .collect();
        let unrealized: Vec<&Value> = slots
            .iter()
            .filter(|s| s.get("qom-path").and_then(Value::as_str).is_none())
            .collect();

        let current = realized.len() as u32;
        self.online.store(current, Ordering::SeqCst);
        bus.publish(Event::ObserveCpus(current));

        if current < target {
            if let Some(slot) = unrealized.first() {
                let driver = slot
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("host-x86_64-cpu")
                    .to_string();
                let props = slot.get("props").cloned().unwrap_or_else(|| serde_json::json!({}));
                let id = format!("cpu-{}", current);
                if let Err(source) = client.device_add(&driver, &id, props).await {
                    warn!(error = %source, "device_add for CPU hotplug failed");
                }
            }
        } else if current > target {
            let removable = realized.iter().rev().find(|slot| {
                slot.get("qom-path")
                    .and_then(Value::as_str)
                    .map(|path| path.starts_with(REMOVABLE_CPU_PREFIX))
                    .unwrap_or(false)
            });
            match removable {
                Some(slot) => {
                    let qom_path = slot.get("qom-path").and_then(Value::as_str).unwrap_or_default();
                    let id = qom_path.rsplit('/').next().unwrap_or(qom_path);
                    if let Err(source) = client.device_del(id).await {
                        warn!(error = %source, "device_del for CPU unplug failed");
                    }
                }
                None => {
                    warn!(target, current, "no removable CPU slot below the board-fixed count");
                }
            }
        } else {
            bus.publish(Event::ControllerConverged("cpu"));
        }
    }
}

#[async_trait]
impl Component for CpuController {
    fn name(&self) -> &'static str {
        "cpu-controller"
    }

    async fn handle(&self, event: &Event, bus: &Bus) {
        match event {
            Event::Configure { config, .. } => {
                *self.desired.lock().await = Some(config.vm.current_cpus);
                self.reconcile(bus).await;
            }
            Event::MonitorResult(result)
                if result.command == "query-hotpluggable-cpus" && result.successful =>
            {
                if let Some(client) = self.qmp.read().await.clone() {
                    self.handle_hotpluggable_cpus(&client, &result.value, bus).await;
                }
            }
            Event::CpuAdded { .. } | Event::CpuDeleted { .. } => {
                self.reconcile(bus).await;
            }
            _ => {}
        }
    }
}
