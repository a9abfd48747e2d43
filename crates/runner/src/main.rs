use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use runner_core::agent::AgentConnector;
use runner_core::bus::event::PrepLatchEntry;
use runner_core::bus::Component;
use runner_core::config::CloudInitConfig;
use runner_core::controllers::{CpuController, DisplayController, MediaController, RamController};
use runner_core::error::ProcessError;
use runner_core::k8s::{K8sClient, StatusUpdater};
use runner_core::qmp::QmpClient;
use runner_core::statemachine::StateMachine;
use runner_core::{config, qmp, Bus, Event};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Runs inside the VM's pod as PID 1 of the QEMU sidecar: loads the runner
/// configuration, supervises the QEMU process, speaks QMP and the two
/// virtio-serial agent protocols to it, and reconciles observed state back
/// into the owning `VirtualMachine` resource's status.
#[derive(Parser, Debug)]
#[command(name = "runner", version)]
struct Cli {
    /// Path to the runner configuration file (YAML, `/Runner` top key).
    #[arg(short = 'c', long = "config", default_value = "/etc/vmrunner/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let bus = Bus::new();
    let qmp_handle = qmp::new_handle();

    let cfg = config::load(&cli.config).into_diagnostic()?;
    let cfg = Arc::new(cfg);

    let mut components: Vec<Arc<dyn Component>> = Vec::new();
    components.push(Arc::new(StateMachine::new(qmp_handle.clone())));
    components.push(Arc::new(CpuController::new(qmp_handle.clone())));
    components.push(Arc::new(RamController::new(qmp_handle.clone())));
    components.push(Arc::new(MediaController::new(qmp_handle.clone())));
    components.push(Arc::new(DisplayController::new(
        qmp_handle.clone(),
        cfg.paths.display_password_file(),
        cfg.paths.password_expiry_file(),
        cfg.paths.display_login_file(),
    )));
    components.push(Arc::new(AgentConnector::new(
        cfg.paths.guest_agent_socket.clone(),
        cfg.paths.vmop_agent_socket.clone(),
    )));

    if let (Some(namespace), Some(name)) = (cfg.namespace.clone(), cfg.vm_object_name.clone()) {
        match K8sClient::in_cluster(namespace, name) {
            Ok(client) => components.push(Arc::new(StatusUpdater::new(client, cfg.generation))),
            Err(source) => warn!(error = %source, "Kubernetes status updates disabled"),
        }
    } else {
        info!("namespace/vmObjectName not set, Kubernetes status updates disabled");
    }

    let watch_paths = vec![
        cfg.paths.display_password_file(),
        cfg.paths.password_expiry_file(),
        cfg.paths.display_login_file(),
        cfg.paths.monitor_socket.clone(),
        cfg.paths.swtpm_socket.clone(),
    ];
    let _watcher = runner_core::watch::start(watch_paths, bus.clone()).into_diagnostic()?;

    let dispatcher_bus = bus.clone();
    let dispatcher = tokio::spawn(runner_core::bus::run_dispatcher(dispatcher_bus, components));

    // Subscribed before `ConfigLoaded` is published so this receiver can't
    // miss a `PrepComplete` the state machine fires synchronously off the
    // back of it (the common case: no TPM, no cloud-init).
    let mut prep_complete_rx = bus.subscribe();

    bus.publish(Event::ConfigLoaded(cfg.clone()));

    if cfg.vm.use_tpm {
        spawn_swtpm(&cfg, bus.clone());
    }
    if let Some(cloud_init) = cfg.cloud_init.clone() {
        spawn_cloud_init_builder(cloud_init, cfg.paths.data_dir.join("cloud-init"), bus.clone());
    }

    // The QEMU spawn itself waits for the startup prep latch (config loaded,
    // plus TPM/cloud-init if configured) to clear before rendering the
    // command line and starting the process.
    let qemu_bus = bus.clone();
    let cfg_for_qemu = cfg.clone();
    tokio::spawn(async move {
        loop {
            match prep_complete_rx.recv().await {
                Ok(Event::PrepComplete) => break,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
        spawn_qemu(cfg_for_qemu, qemu_bus).await;
    });

    let monitor_socket = cfg.paths.monitor_socket.clone();
    let qmp_bus = bus.clone();
    let qmp_handle_for_connect = qmp_handle.clone();
    tokio::spawn(async move {
        while !runner_core::watch::already_exists(&monitor_socket) {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        // `connect` populates `qmp_handle_for_connect` itself, under lock,
        // before it publishes `Event::QmpReady` — so no component can
        // observe `QmpReady` while the handle is still empty.
        if let Err(source) =
            QmpClient::connect(&monitor_socket, qmp_bus.clone(), qmp_handle_for_connect).await
        {
            error!(error = %source, "failed to connect to QMP socket");
            qmp_bus.publish(Event::Stop {
                reason: "QMP connection failed".to_string(),
            });
        }
    });

    let sigterm_bus = bus.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(source) => {
                error!(error = %source, "failed to install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
        info!("received SIGTERM, beginning graceful shutdown");
        sigterm_bus.publish(Event::Stop {
            reason: "SIGTERM".to_string(),
        });
    });

    let mut exit_receiver = bus.subscribe();
    let exit_code = loop {
        match exit_receiver.recv().await {
            Ok(Event::Exit(code)) => break code,
            Ok(_) => continue,
            Err(_) => break 1,
        }
    };

    dispatcher.abort();
    std::process::exit(exit_code);
}

/// Spawn `swtpm` against the config's TPM state directory and control
/// socket. The socket file's appearance (not this process starting) is what
/// clears the `Tpm` prep-latch entry, via the file watcher.
fn spawn_swtpm(cfg: &Arc<config::Config>, bus: Bus) {
    let state_dir = cfg.paths.data_dir.join("tpm");
    let socket_path = cfg.paths.swtpm_socket.clone();
    tokio::spawn(async move {
        if let Err(source) = tokio::fs::create_dir_all(&state_dir).await {
            error!(error = %source, "failed to create swtpm state directory");
            bus.publish(Event::Stop {
                reason: "failed to create swtpm state directory".to_string(),
            });
            return;
        }
        let args = vec![
            "socket".to_string(),
            "--tpmstate".to_string(),
            format!("dir={}", state_dir.display()),
            "--ctrl".to_string(),
            format!("type=unixio,path={}", socket_path.display()),
            "--tpm2".to_string(),
        ];
        match runner_core::process::spawn("swtpm", "swtpm", &args, None).await {
            Ok(supervised) => runner_core::process::supervise(supervised, bus).await,
            Err(source) => {
                error!(error = %source, "failed to spawn swtpm");
                bus.publish(Event::Stop {
                    reason: "failed to spawn swtpm".to_string(),
                });
            }
        }
    });
}

/// Build the cloud-init NoCloud seed ISO as a one-shot child process. Its
/// exit, not its start, clears the `CloudInit` prep-latch entry.
fn spawn_cloud_init_builder(cloud_init: CloudInitConfig, dir: PathBuf, bus: Bus) {
    let iso_path = dir
        .parent()
        .map(|p| p.join("cloud-init.iso"))
        .unwrap_or_else(|| dir.join("cloud-init.iso"));
    tokio::spawn(async move {
        match build_cloud_init_iso(&cloud_init, &dir, &iso_path).await {
            Ok(()) => bus.publish(Event::PrepLatchCleared(PrepLatchEntry::CloudInit)),
            Err(source) => {
                error!(error = %source, "failed to build cloud-init ISO");
                bus.publish(Event::Stop {
                    reason: "failed to build cloud-init ISO".to_string(),
                });
            }
        }
    });
}

async fn build_cloud_init_iso(
    cloud_init: &CloudInitConfig,
    dir: &Path,
    iso_path: &Path,
) -> Result<(), ProcessError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ProcessError::Spawn {
            program: "genisoimage".to_string(),
            source,
        })?;

    let user_data_path = dir.join("user-data");
    let meta_data_path = dir.join("meta-data");
    tokio::fs::write(&user_data_path, cloud_init.user_data.clone().unwrap_or_default())
        .await
        .map_err(|source| ProcessError::Spawn {
            program: "genisoimage".to_string(),
            source,
        })?;
    tokio::fs::write(&meta_data_path, cloud_init.meta_data.clone().unwrap_or_default())
        .await
        .map_err(|source| ProcessError::Spawn {
            program: "genisoimage".to_string(),
            source,
        })?;

    let mut args = vec![
        "-output".to_string(),
        iso_path.to_string_lossy().into_owned(),
        "-volid".to_string(),
        "cidata".to_string(),
        "-joliet".to_string(),
        "-rock".to_string(),
        user_data_path.to_string_lossy().into_owned(),
        meta_data_path.to_string_lossy().into_owned(),
    ];
    if let Some(network_config) = &cloud_init.network_config {
        let network_config_path = dir.join("network-config");
        tokio::fs::write(&network_config_path, network_config)
            .await
            .map_err(|source| ProcessError::Spawn {
                program: "genisoimage".to_string(),
                source,
            })?;
        args.push(network_config_path.to_string_lossy().into_owned());
    }

    let success = runner_core::process::run_to_completion("genisoimage", &args).await?;
    if success {
        Ok(())
    } else {
        Err(ProcessError::NonZeroExit {
            program: "genisoimage".to_string(),
            status: "non-zero exit".to_string(),
        })
    }
}

async fn spawn_qemu(cfg: Arc<config::Config>, bus: Bus) {
    let firmware = match config::resolve_firmware(cfg.vm.firmware, &cfg.paths.fw_vars_file()) {
        Ok(firmware) => firmware,
        Err(source) => {
            error!(error = %source, "failed to resolve firmware");
            bus.publish(Event::Stop {
                reason: "failed to resolve firmware".to_string(),
            });
            return;
        }
    };
    let template_text = match config::load_template_text(&cfg) {
        Ok(text) => text,
        Err(source) => {
            error!(error = %source, "failed to load QEMU template");
            bus.publish(Event::Stop {
                reason: "failed to load QEMU template".to_string(),
            });
            return;
        }
    };
    let argv = match config::render_template(&template_text, &cfg, &firmware) {
        Ok(argv) => argv,
        Err(source) => {
            error!(error = %source, "failed to render QEMU template");
            bus.publish(Event::Stop {
                reason: "failed to render QEMU template".to_string(),
            });
            return;
        }
    };
    let pid_file = cfg.paths.runner_pid_file();
    match runner_core::process::spawn("qemu", "qemu-system-x86_64", &argv, Some(&pid_file)).await {
        Ok(supervised) => runner_core::process::supervise(supervised, bus).await,
        Err(source) => {
            error!(error = %source, "failed to spawn qemu-system-x86_64");
            bus.publish(Event::Stop {
                reason: "failed to spawn QEMU".to_string(),
            });
        }
    }
}
