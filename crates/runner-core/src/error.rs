use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading and validating the runner's configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config is missing mandatory field `{field}`")]
    MissingField { field: &'static str },

    #[error("invalid memory size `{raw}`: {detail}")]
    InvalidMemorySize { raw: String, detail: String },

    #[error("unknown firmware variant `{variant}`")]
    UnknownFirmware { variant: String },

    #[error("no candidate firmware path exists for variant `{variant}` (tried: {tried:?})")]
    FirmwareNotFound { variant: String, tried: Vec<PathBuf> },

    #[error("could not create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not persist VM UUID at {path}: {source}")]
    PersistUuid {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to render QEMU template: {detail}")]
    TemplateRender { detail: String },
}

/// Errors from the QMP client.
#[derive(Debug, Error)]
pub enum QmpError {
    #[error("failed to connect to QMP socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("QMP socket {path} closed unexpectedly")]
    Closed { path: PathBuf },

    #[error("QMP greeting/handshake failed: {detail}")]
    Handshake { detail: String },

    #[error("failed to serialize QMP command `{command}`: {source}")]
    Serialize {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write to QMP socket: {source}")]
    Write {
        #[source]
        source: std::io::Error,
    },

    #[error("malformed QMP line: {detail}")]
    MalformedLine { detail: String },

    #[error("QEMU returned an error for `{command}`: {message}")]
    CommandFailed { command: String, message: String },
}

/// Errors from the guest-agent and VM-operator-agent clients.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to agent socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("agent socket {path} closed")]
    Closed { path: PathBuf },

    #[error("failed to write to agent socket {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed agent response: {detail}")]
    MalformedResponse { detail: String },

    #[error("agent returned error code {code}: {message}")]
    ErrorResponse { code: u16, message: String },
}

/// Errors from spawning and supervising child processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with status {status}")]
    NonZeroExit { program: String, status: String },

    #[error("failed to wait on `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the Kubernetes status updater's REST client.
#[derive(Debug, Error)]
pub enum K8sError {
    #[error("failed to read service account token at {path}: {source}")]
    ReadToken {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {source}")]
    BuildClient {
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API server returned {status} for {url}: {body}")]
    ApiError {
        status: u16,
        url: String,
        body: String,
    },

    #[error("exhausted {attempts} retries patching status due to repeated conflicts")]
    ConflictRetriesExhausted { attempts: u32 },

    #[error("failed to decode API response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level error type, composed at component boundaries. A `RunnerError`
/// is never returned from the event-dispatch loop itself — it is converted
/// to a `Stop`/`Exit` bus event.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Qmp(#[from] QmpError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    K8s(#[from] K8sError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = RunnerError> = std::result::Result<T, E>;
