use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;

/// Result of a single QMP command, published when its response pops the
/// head of the `executing` queue.
#[derive(Debug, Clone)]
pub struct MonitorResult {
    pub command: String,
    pub successful: bool,
    pub value: Value,
    pub error_message: Option<String>,
}

/// Outcome of a VM-operator agent command (login/logout), matched FIFO
/// against the agent's deque of outstanding commands.
#[derive(Debug, Clone)]
pub struct VmopAgentResult {
    pub command: String,
    pub successful: bool,
    pub message: String,
}

/// The tagged sum type flowing over the bus. Every component both reads and
/// writes this type; the dispatcher preserves fire order per originating
/// pipeline.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new or reloaded configuration is available.
    ConfigLoaded(Arc<Config>),
    /// The config file failed to load or re-validate.
    ConfigError(String),

    /// A watched path was created (socket files, display-credential files).
    FileCreated(PathBuf),
    /// A watched path's contents changed.
    FileChanged(PathBuf),

    /// One entry of the startup prep latch cleared.
    PrepLatchCleared(PrepLatchEntry),
    /// The startup prep latch (`Config` plus any `Tpm`/`CloudInit` entries
    /// the configuration requires) has fully cleared; QEMU may be spawned.
    PrepComplete,

    /// A child process exited.
    ChildExited { name: String, success: bool, code: Option<i32> },
    /// A line of stdout/stderr from a supervised child.
    ChildOutput { name: String, stream: StdStream, line: String },

    /// The QMP socket file appeared on disk and is ready to be opened.
    QmpSocketReady,
    /// The QMP connection completed capability negotiation.
    QmpReady,
    /// The QMP socket closed (QEMU exited or the connection otherwise died).
    QmpClosed,
    /// Response to a previously issued QMP command.
    MonitorResult(MonitorResult),
    /// Demultiplexed QMP async event: `POWERDOWN`.
    PowerdownEvent,
    /// Demultiplexed QMP async event: `DEVICE_TRAY_MOVED`.
    TrayMovedEvent { device: String, open: bool },
    /// Demultiplexed QMP async event: `VSERPORT_CHANGE`.
    VserportChangeEvent { id: String, open: bool },
    /// Demultiplexed QMP async event: `CPU_ADDED` / `CPU_DELETED`.
    CpuAdded { id: String },
    CpuDeleted { id: String },
    /// Demultiplexed QMP async events: SPICE connect/disconnect.
    SpiceConnected { client: String },
    SpiceDisconnected { client: String },

    /// The guest agent published OS info after a successful
    /// `guest-get-osinfo`.
    OsInfo(Value),

    /// VM-operator agent connected (its `220` greeting arrived).
    VmopAgentConnected,
    /// Request to log a user in / out through the VM-operator agent.
    VmopAgentLogIn { user: String },
    VmopAgentLogOut,
    /// VM-operator agent confirmed login / logout.
    VmopAgentLoggedIn { user: String },
    VmopAgentLoggedOut,
    /// Result of any other VM-operator agent command.
    VmopAgentResult(VmopAgentResult),

    /// One of the two watched display-credential files changed.
    DisplayPasswordChanged(Vec<u8>),
    DisplayExpiryChanged(String),
    DisplayLoginConfigChanged(Option<bool>),

    /// Fire a full reconcile pass across all sub-controllers. `initial` is
    /// true only for the first `Configure` delivered after cold start, when
    /// QEMU's own argv already established the state a sub-controller would
    /// otherwise reconcile towards.
    Configure { config: Arc<Config>, initial: bool },
    /// A sub-controller finished reconciling towards the `Configure` it most
    /// recently received.
    ControllerConverged(&'static str),
    /// All sub-controllers have converged on the `Configure` they received.
    ConfigureConverged,

    /// Request a graceful shutdown (SIGTERM, fatal startup error, fatal
    /// child exit while `Running`, or a fatal QMP/agent condition).
    Stop { reason: String },
    /// The process should exit immediately with this status.
    Exit(i32),

    /// A sub-controller or the Kubernetes status updater observed a change
    /// worth reflecting into `status`.
    ObserveCpus(u32),
    ObserveRam(u64),
    ObserveOsInfo(Value),
    ObservePhase(&'static str),
    ObserveConsoleConnected(bool),
    ObserveUserLoggedIn(Option<String>),
    ObserveResetCounter(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrepLatchEntry {
    Config,
    Tpm,
    CloudInit,
}
