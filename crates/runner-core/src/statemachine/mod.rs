use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::event::PrepLatchEntry;
use crate::bus::{Bus, Component, Event};
use crate::config::Config;
use crate::qmp::QmpHandle;

/// Lifecycle phase of the VM, mirrored into status as a plain string via
/// `Event::ObservePhase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Starting,
    Booting,
    Booted,
    Running,
    Terminating,
    Stopped,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::Starting => "Starting",
            Phase::Booting => "Booting",
            Phase::Booted => "Booted",
            Phase::Running => "Running",
            Phase::Terminating => "Terminating",
            Phase::Stopped => "Stopped",
        }
    }
}

/// The set of sub-controllers the `Running` phase waits on to report
/// convergence on their initial `Configure`.
const CONVERGENCE_SET: [&str; 3] = ["cpu", "ram", "media"];

struct Inner {
    phase: Phase,
    prep_latch: HashSet<PrepLatchEntry>,
    required_latch: HashSet<PrepLatchEntry>,
    prep_complete_fired: bool,
    qmp_ready: bool,
    configure_delivered: bool,
    swtpm_socket: Option<PathBuf>,
    pending_configure: Option<Arc<Config>>,
    convergence_pending: HashSet<&'static str>,
    powerdown_timeout: Duration,
    shutdown_cancel: Option<oneshot::Sender<()>>,
}

/// Drives the VM through its lifecycle phases, gates `Configure` on the QMP
/// connection being up (QEMU ignores monitor commands before capability
/// negotiation completes), tracks the startup prep latch (config loaded,
/// TPM ready, cloud-init image built) before the QEMU process is spawned,
/// counts sub-controller convergence towards `Running`, and runs the
/// two-stage graceful shutdown: a short confirmation window followed by a
/// bounded completion window, both reschedulable if a fresh `Stop` arrives
/// mid-sequence.
pub struct StateMachine {
    qmp: QmpHandle,
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new(qmp: QmpHandle) -> Self {
        Self {
            qmp,
            inner: Mutex::new(Inner {
                phase: Phase::Initializing,
                prep_latch: HashSet::new(),
                required_latch: HashSet::from([PrepLatchEntry::Config]),
                prep_complete_fired: false,
                qmp_ready: false,
                configure_delivered: false,
                swtpm_socket: None,
                pending_configure: None,
                convergence_pending: HashSet::new(),
                powerdown_timeout: Duration::from_secs(30),
                shutdown_cancel: None,
            }),
        }
    }

    async fn set_phase(&self, phase: Phase, bus: &Bus) {
        let mut inner = self.inner.lock().await;
        if inner.phase == phase {
            return;
        }
        info!(from = inner.phase.as_str(), to = phase.as_str(), "phase transition");
        inner.phase = phase;
        drop(inner);
        bus.publish(Event::ObservePhase(phase.as_str()));
    }

    /// Recompute the required latch from the configuration and, if already
    /// satisfied and not previously announced, publish `PrepComplete`.
    async fn recompute_latch(&self, config: &Config, bus: &Bus) {
        let mut required = HashSet::from([PrepLatchEntry::Config]);
        if config.vm.use_tpm {
            required.insert(PrepLatchEntry::Tpm);
        }
        if config.cloud_init.is_some() {
            required.insert(PrepLatchEntry::CloudInit);
        }
        {
            let mut inner = self.inner.lock().await;
            inner.required_latch = required;
        }
        self.maybe_complete_prep(bus).await;
    }

    async fn maybe_complete_prep(&self, bus: &Bus) {
        let fire = {
            let mut inner = self.inner.lock().await;
            let satisfied = inner
                .required_latch
                .iter()
                .all(|entry| inner.prep_latch.contains(entry));
            if satisfied && !inner.prep_complete_fired {
                inner.prep_complete_fired = true;
                true
            } else {
                false
            }
        };
        if fire {
            self.set_phase(Phase::Starting, bus).await;
            bus.publish(Event::PrepComplete);
        }
    }

    async fn maybe_deliver_configure(&self, bus: &Bus) {
        let (config, initial) = {
            let mut inner = self.inner.lock().await;
            if !inner.qmp_ready {
                return;
            }
            let Some(config) = inner.pending_configure.take() else {
                return;
            };
            let initial = !inner.configure_delivered;
            inner.configure_delivered = true;
            inner.convergence_pending = CONVERGENCE_SET.iter().copied().collect();
            (config, initial)
        };
        bus.publish(Event::Configure { config, initial });
    }

    async fn note_controller_converged(&self, name: &'static str, bus: &Bus) {
        let satisfied = {
            let mut inner = self.inner.lock().await;
            inner.convergence_pending.remove(name);
            inner.convergence_pending.is_empty()
        };
        if satisfied {
            bus.publish(Event::ConfigureConverged);
        }
    }

    async fn begin_shutdown(&self, reason: String, bus: Bus) {
        self.set_phase(Phase::Terminating, &bus).await;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let timeout = {
            let mut inner = self.inner.lock().await;
            if let Some(previous) = inner.shutdown_cancel.take() {
                let _ = previous.send(());
            }
            inner.shutdown_cancel = Some(cancel_tx);
            inner.powerdown_timeout
        };

        let qmp = self.qmp.read().await.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("shutdown sequence superseded");
                    return;
                }
                _ = sleep(Duration::from_secs(1)) => {}
            }
            debug!(reason, "issuing system_powerdown");
            if let Some(client) = &qmp {
                if let Err(source) = client.system_powerdown().await {
                    warn!(error = %source, "system_powerdown failed");
                }
            }

            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("shutdown sequence superseded during completion wait");
                }
                _ = sleep(timeout) => {
                    warn!("guest did not shut down within the timeout, forcing quit");
                    if let Some(client) = &qmp {
                        let _ = client.quit().await;
                    }
                    bus.publish(Event::Exit(0));
                }
            }
        });
    }

    async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }
}

#[async_trait]
impl Component for StateMachine {
    fn name(&self) -> &'static str {
        "statemachine"
    }

    async fn handle(&self, event: &Event, bus: &Bus) {
        match event {
            Event::ConfigLoaded(config) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.prep_latch.insert(PrepLatchEntry::Config);
                    inner.powerdown_timeout = Duration::from_secs(config.vm.powerdown_timeout);
                    inner.swtpm_socket = Some(config.paths.swtpm_socket.clone());
                }
                self.recompute_latch(config, bus).await;
                {
                    let mut inner = self.inner.lock().await;
                    inner.pending_configure = Some(config.clone());
                }
                self.maybe_deliver_configure(bus).await;
            }
            Event::PrepLatchCleared(entry) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.prep_latch.insert(*entry);
                }
                self.maybe_complete_prep(bus).await;
            }
            Event::FileCreated(path) => {
                // Tpm clears when the swtpm socket file appears, not when
                // the swtpm process starts.
                let is_swtpm_socket = {
                    let inner = self.inner.lock().await;
                    inner.swtpm_socket.as_deref() == Some(path.as_path())
                };
                if is_swtpm_socket {
                    {
                        let mut inner = self.inner.lock().await;
                        inner.prep_latch.insert(PrepLatchEntry::Tpm);
                    }
                    self.maybe_complete_prep(bus).await;
                }
            }
            Event::QmpReady => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.qmp_ready = true;
                }
                self.set_phase(Phase::Booting, bus).await;
                self.maybe_deliver_configure(bus).await;
                if let Some(client) = self.qmp.read().await.clone() {
                    if let Err(source) = client.cont().await {
                        warn!(error = %source, "cont failed after QMP handshake");
                    }
                }
            }
            Event::QmpClosed => {
                let mut inner = self.inner.lock().await;
                inner.qmp_ready = false;
            }
            Event::OsInfo(_) => {
                self.set_phase(Phase::Booted, bus).await;
            }
            Event::ControllerConverged(name) => {
                self.note_controller_converged(*name, bus).await;
            }
            Event::ConfigureConverged => {
                self.set_phase(Phase::Running, bus).await;
            }
            Event::ChildExited { name, success, code } if name == "qemu" => {
                if *success {
                    self.set_phase(Phase::Stopped, bus).await;
                    bus.publish(Event::Exit(0));
                } else {
                    warn!(?code, "qemu exited unexpectedly");
                    self.set_phase(Phase::Stopped, bus).await;
                    bus.publish(Event::Exit(code.unwrap_or(1)));
                }
            }
            Event::ChildExited { name, success, code } => {
                let phase = self.phase().await;
                if phase == Phase::Starting {
                    warn!(name, ?code, "child process exited during startup, stopping");
                    bus.publish(Event::Stop {
                        reason: format!("{name} exited during startup"),
                    });
                } else if !success {
                    warn!(name, ?code, "child process exited unexpectedly");
                } else {
                    debug!(name, "child process exited");
                }
            }
            Event::Stop { reason } => {
                self.begin_shutdown(reason.clone(), bus.clone()).await;
            }
            _ => {}
        }
    }
}
