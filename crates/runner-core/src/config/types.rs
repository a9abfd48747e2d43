use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Firmware variant, resolving to a ROM path and a per-VM mutable vars path
/// via the built-in candidate table (see `firmware` module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Firmware {
    Bios,
    Uefi,
    #[serde(rename = "uefi-4m")]
    Uefi4m,
    Secure,
    #[serde(rename = "secure-4m")]
    Secure4m,
}

impl Default for Firmware {
    fn default() -> Self {
        Firmware::Bios
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Drive {
    #[serde(rename = "type")]
    pub drive_type: DriveType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootindex: Option<u32>,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkInterface {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpiceDisplay {
    pub port: Option<u16>,
    #[serde(default)]
    pub usb_redirects: u32,
    pub ticket: Option<String>,
    pub proxy_url: Option<String>,
    #[serde(default = "default_true")]
    pub server: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DisplayConfig {
    pub spice: Option<SpiceDisplay>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum DesiredState {
    Running,
    Stopped,
}

impl Default for DesiredState {
    fn default() -> Self {
        DesiredState::Running
    }
}

/// The `vm:` subsection of the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub name: String,
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub use_tpm: bool,
    #[serde(default)]
    pub boot_menu: bool,
    #[serde(default)]
    pub firmware: Firmware,

    #[serde(deserialize_with = "crate::memsize::serde_bytes::deserialize")]
    pub maximum_ram: u64,
    #[serde(deserialize_with = "crate::memsize::serde_bytes::deserialize")]
    pub current_ram: u64,

    pub cpu_model: Option<String>,
    pub maximum_cpus: u32,
    pub current_cpus: u32,
    #[serde(default)]
    pub cpu_sockets: Option<u32>,
    #[serde(default)]
    pub dies_per_socket: Option<u32>,
    #[serde(default)]
    pub cores_per_die: Option<u32>,
    #[serde(default)]
    pub threads_per_core: Option<u32>,

    pub accelerator: Option<String>,
    pub rtc_base: Option<String>,
    pub rtc_clock: Option<String>,

    #[serde(default = "default_powerdown_timeout")]
    pub powerdown_timeout: u64,

    #[serde(default)]
    pub network: Vec<NetworkInterface>,
    #[serde(default)]
    pub drives: Vec<Drive>,
    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub state: DesiredState,
    #[serde(default)]
    pub reset_count: u32,

    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub permissions: serde_json::Value,
}

fn default_powerdown_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitConfig {
    pub meta_data: Option<String>,
    pub user_data: Option<String>,
    pub network_config: Option<String>,
}

/// Paths used by the runner, some persistent (`dataDir`) and some ephemeral
/// (`runtimeDir`).
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub monitor_socket: PathBuf,
    pub swtpm_socket: PathBuf,
    pub guest_agent_socket: PathBuf,
    pub vmop_agent_socket: PathBuf,
}

impl Paths {
    pub fn uuid_file(&self) -> PathBuf {
        self.data_dir.join("uuid.txt")
    }

    pub fn template_file(&self) -> PathBuf {
        self.data_dir.join("VM.ftl.yaml")
    }

    pub fn fw_vars_file(&self) -> PathBuf {
        self.data_dir.join("fw-vars.fd")
    }

    pub fn runner_pid_file(&self) -> PathBuf {
        self.runtime_dir.join("runner.pid")
    }

    pub fn display_password_file(&self) -> PathBuf {
        self.data_dir.join("display-password")
    }

    pub fn password_expiry_file(&self) -> PathBuf {
        self.data_dir.join("password-expiry")
    }

    pub fn display_login_file(&self) -> PathBuf {
        self.data_dir.join("display-login")
    }

    pub fn ticket_file(&self) -> PathBuf {
        self.runtime_dir.join("ticket.txt")
    }
}

/// The full, immutable configuration snapshot. Replaced wholesale on every
/// reload rather than mutated in place.
#[derive(Debug, Clone)]
pub struct Config {
    pub vm: VmConfig,
    pub paths: Paths,
    pub cloud_init: Option<CloudInitConfig>,
    pub template_override: Option<PathBuf>,
    pub update_template: bool,
    pub as_of: chrono::DateTime<chrono::Utc>,
    pub has_display_password: bool,
    pub namespace: Option<String>,
    pub vm_object_name: Option<String>,
    pub operator_name: String,
    pub generation: i64,
}

/// Raw on-disk YAML shape, namespaced under `/Runner`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(rename = "/Runner")]
    pub runner: RawRunnerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRunnerSection {
    pub data_dir: PathBuf,
    pub runtime_dir: PathBuf,
    #[serde(default)]
    pub template: Option<PathBuf>,
    #[serde(default)]
    pub update_template: bool,
    #[serde(default)]
    pub swtpm_socket: Option<PathBuf>,
    #[serde(default)]
    pub monitor_socket: Option<PathBuf>,
    #[serde(default)]
    pub cloud_init: Option<CloudInitConfig>,
    pub vm: VmConfig,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub vm_object_name: Option<String>,
    #[serde(default)]
    pub operator_name: Option<String>,
    #[serde(default)]
    pub generation: i64,
}
