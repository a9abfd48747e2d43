use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, Event};
use crate::bus::event::StdStream;
use crate::error::ProcessError;

/// A supervised child process: QEMU itself, `swtpm`, or the cloud-init ISO
/// builder. Each gets its own dedicated supervisor task; stdout/stderr are
/// forwarded to the bus line-by-line so the runner's log interleaves
/// cleanly with its own `tracing` output.
pub struct Supervised {
    pub name: String,
    pub child: tokio::process::Child,
}

/// Spawn `program` with `args`, piping stdout/stderr, and writing a pidfile
/// if `pid_file` is given.
pub async fn spawn(
    name: &str,
    program: &str,
    args: &[String],
    pid_file: Option<&PathBuf>,
) -> Result<Supervised, ProcessError> {
    debug!(name, program, ?args, "spawning child process");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(pid_file) = pid_file {
        if let Some(pid) = child.id() {
            let _ = tokio::fs::write(pid_file, pid.to_string()).await;
        }
    }

    info!(name, program, pid = child.id(), "process spawned");
    Ok(Supervised {
        name: name.to_string(),
        child,
    })
}

/// Drive a supervised child to completion on its own task: forward output
/// lines onto the bus, then publish `ChildExited` once it terminates. This
/// function does not return until the child exits; callers `tokio::spawn`
/// it.
pub async fn supervise(mut supervised: Supervised, bus: Bus) {
    let name = supervised.name.clone();
    let stdout = supervised.child.stdout.take();
    let stderr = supervised.child.stderr.take();

    if let Some(stdout) = stdout {
        let bus = bus.clone();
        let name = name.clone();
        tokio::spawn(forward_lines(stdout, name, StdStream::Stdout, bus));
    }
    if let Some(stderr) = stderr {
        let bus = bus.clone();
        let name = name.clone();
        tokio::spawn(forward_lines(stderr, name, StdStream::Stderr, bus));
    }

    match supervised.child.wait().await {
        Ok(status) => {
            let success = status.success();
            if !success {
                warn!(name, status = %status, "child process exited non-zero");
            } else {
                info!(name, "child process exited");
            }
            bus.publish(Event::ChildExited {
                name,
                success,
                code: status.code(),
            });
        }
        Err(source) => {
            error!(name, error = %source, "failed to wait on child process");
            bus.publish(Event::ChildExited {
                name,
                success: false,
                code: None,
            });
        }
    }
}

async fn forward_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    name: String,
    stream: StdStream,
    bus: Bus,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(name = %name, stream = ?stream, "{line}");
                bus.publish(Event::ChildOutput {
                    name: name.clone(),
                    stream,
                    line,
                });
            }
            Ok(None) => break,
            Err(source) => {
                warn!(name = %name, error = %source, "error reading child output");
                break;
            }
        }
    }
}

/// Run a short-lived child to completion and return whether it exited
/// successfully, without wiring it into the bus (used for the cloud-init
/// ISO builder, which is a one-shot operation gating the prep latch rather
/// than a long-lived supervised process).
pub async fn run_to_completion(program: &str, args: &[String]) -> Result<bool, ProcessError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        warn!(
            program,
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "short-lived process exited non-zero"
        );
    }
    Ok(output.status.success())
}
