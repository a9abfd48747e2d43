use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use crate::bus::{Bus, Component, Event};

use super::client::K8sClient;

/// One `status.conditions[]` record, matching the Kubernetes convention of
/// `{type, status, reason, message, lastTransitionTime, observedGeneration}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Condition {
    #[serde(rename = "type")]
    condition_type: &'static str,
    status: &'static str,
    reason: String,
    message: String,
    last_transition_time: String,
    observed_generation: i64,
}

#[derive(Debug, Clone, Default)]
struct StatusSnapshot {
    phase: Option<&'static str>,
    cpus: Option<u32>,
    ram: Option<u64>,
    os_info: Option<Value>,
    logged_in_user: Option<Option<String>>,
    reset_counter: Option<u32>,
    observed_generation: i64,
    conditions: BTreeMap<&'static str, Condition>,
}

impl StatusSnapshot {
    /// Insert or update a condition. `lastTransitionTime` only advances when
    /// `status`/`reason` actually differ from the previous record for this
    /// type; `observedGeneration` is always set to the current value.
    /// Returns whether the stored record changed at all, so callers can
    /// decide whether a patch attempt is worth making.
    fn upsert_condition(
        &mut self,
        condition_type: &'static str,
        status: bool,
        reason: &str,
        message: &str,
        generation: i64,
        now: &str,
    ) -> bool {
        let status_str = if status { "True" } else { "False" };
        let existing = self.conditions.get(condition_type);
        let transition_changed = existing
            .map(|c| c.status != status_str || c.reason != reason)
            .unwrap_or(true);
        let last_transition_time = if transition_changed {
            now.to_string()
        } else {
            existing.unwrap().last_transition_time.clone()
        };
        let new_condition = Condition {
            condition_type,
            status: status_str,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time,
            observed_generation: generation,
        };
        let differs = existing != Some(&new_condition);
        self.conditions.insert(condition_type, new_condition);
        differs
    }

    fn to_json(&self) -> Value {
        let mut status = serde_json::Map::new();
        status.insert("observedGeneration".into(), json!(self.observed_generation));
        if let Some(phase) = self.phase {
            status.insert("phase".into(), json!(phase));
        }
        if let Some(cpus) = self.cpus {
            status.insert("cpus".into(), json!(cpus));
        }
        if let Some(ram) = self.ram {
            status.insert("ram".into(), json!(ram));
        }
        if let Some(os_info) = &self.os_info {
            status.insert("osInfo".into(), os_info.clone());
        }
        if let Some(user) = &self.logged_in_user {
            status.insert("loggedInUser".into(), json!(user));
        }
        if let Some(counter) = self.reset_counter {
            status.insert("resetCount".into(), json!(counter));
        }
        if !self.conditions.is_empty() {
            let conditions: Vec<Value> = self
                .conditions
                .values()
                .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
                .collect();
            status.insert("conditions".into(), Value::Array(conditions));
        }
        Value::Object(status)
    }
}

/// Folds `Observe*` bus events into a status snapshot — flat scalar fields
/// plus the `Running`/`Booted`/`VmopAgentConnected`/`UserLoggedIn`/
/// `ConsoleConnected` conditions — and patches the custom resource's
/// `status` subresource whenever it changes. Also emits `events.k8s.io`
/// Events for console connect/disconnect. Kept as its own component (rather
/// than inline in each controller) so every status write goes through one
/// conflict-retrying path.
pub struct StatusUpdater {
    client: K8sClient,
    snapshot: Mutex<StatusSnapshot>,
}

impl StatusUpdater {
    pub fn new(client: K8sClient, generation: i64) -> Self {
        Self {
            client,
            snapshot: Mutex::new(StatusSnapshot {
                observed_generation: generation,
                ..Default::default()
            }),
        }
    }

    async fn flush(&self) {
        let snapshot = self.snapshot.lock().await.clone();
        if let Err(source) = self.client.patch_status_if_changed(snapshot.to_json()).await {
            warn!(error = %source, "failed to patch VirtualMachine status");
        }
    }
}

#[async_trait::async_trait]
impl Component for StatusUpdater {
    fn name(&self) -> &'static str {
        "status-updater"
    }

    async fn handle(&self, event: &Event, _bus: &Bus) {
        let now = chrono::Utc::now().to_rfc3339();
        let mut console_event: Option<bool> = None;

        let changed = {
            let mut snapshot = self.snapshot.lock().await;
            let generation = snapshot.observed_generation;
            match event {
                Event::ObservePhase(phase) => {
                    let phase_changed = snapshot.phase != Some(*phase);
                    snapshot.phase = Some(*phase);
                    let mut condition_changed = false;
                    if matches!(*phase, "Booted" | "Running") {
                        condition_changed |= snapshot.upsert_condition(
                            "Booted",
                            true,
                            "GuestReportedOsInfo",
                            "guest agent reported OS info",
                            generation,
                            &now,
                        );
                    }
                    if *phase == "Running" {
                        condition_changed |= snapshot.upsert_condition(
                            "Running",
                            true,
                            "SubControllersConverged",
                            "all sub-controllers converged on the initial configuration",
                            generation,
                            &now,
                        );
                    } else if matches!(*phase, "Terminating" | "Stopped") {
                        condition_changed |= snapshot.upsert_condition(
                            "Running",
                            false,
                            phase,
                            "runner is shutting down",
                            generation,
                            &now,
                        );
                    }
                    phase_changed || condition_changed
                }
                Event::ObserveCpus(cpus) => {
                    let changed = snapshot.cpus != Some(*cpus);
                    snapshot.cpus = Some(*cpus);
                    changed
                }
                Event::ObserveRam(ram) => {
                    let changed = snapshot.ram != Some(*ram);
                    snapshot.ram = Some(*ram);
                    changed
                }
                Event::ObserveOsInfo(info) => {
                    let changed = snapshot.os_info.as_ref() != Some(info);
                    snapshot.os_info = Some(info.clone());
                    changed
                }
                Event::ObserveConsoleConnected(connected) => {
                    console_event = Some(*connected);
                    let (reason, message) = if *connected {
                        ("ClientConnected", "a console client connected")
                    } else {
                        ("ClientDisconnected", "the console client disconnected")
                    };
                    snapshot.upsert_condition(
                        "ConsoleConnected",
                        *connected,
                        reason,
                        message,
                        generation,
                        &now,
                    )
                }
                Event::ObserveUserLoggedIn(user) => {
                    let flat_changed = snapshot.logged_in_user.as_ref() != Some(user);
                    snapshot.logged_in_user = Some(user.clone());
                    let (reason, message) = match user {
                        Some(name) => ("AgentConfirmedLogin", name.as_str()),
                        None => ("AgentConfirmedLogout", ""),
                    };
                    let condition_changed = snapshot.upsert_condition(
                        "UserLoggedIn",
                        user.is_some(),
                        reason,
                        message,
                        generation,
                        &now,
                    );
                    flat_changed || condition_changed
                }
                Event::ObserveResetCounter(count) => {
                    let changed = snapshot.reset_counter != Some(*count);
                    snapshot.reset_counter = Some(*count);
                    changed
                }
                Event::VmopAgentConnected => snapshot.upsert_condition(
                    "VmopAgentConnected",
                    true,
                    "AgentGreetingReceived",
                    "VM-operator agent connected",
                    generation,
                    &now,
                ),
                _ => false,
            }
        };

        if changed {
            self.flush().await;
        }

        if let Some(connected) = console_event {
            let (reason, message) = if connected {
                ("ConsoleConnected", "a console client connected")
            } else {
                ("ConsoleDisconnected", "the console client disconnected")
            };
            if let Err(source) = self.client.emit_event(reason, message, "Normal").await {
                warn!(error = %source, "failed to emit console connect/disconnect event");
            }
        }
    }
}
