use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::bus::event::VmopAgentResult;
use crate::bus::{Bus, Event};
use crate::error::AgentError;

/// Outstanding command awaiting its reply line, tracked FIFO like the QMP
/// `executing` queue.
struct PendingCommand {
    name: String,
}

/// Client for the VM-operator agent: a line-oriented text protocol over its
/// own virtio-serial port, modeled on SMTP reply codes. The greeting is
/// `220 ...`; `1xx` lines are intermediate and ignored; `201`/`202` report
/// login/logout; any other code is a command failure.
pub struct VmopAgentClient {
    path: PathBuf,
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    executing: Arc<Mutex<VecDeque<PendingCommand>>>,
}

impl VmopAgentClient {
    pub async fn connect(path: &Path, bus: Bus) -> Result<Self, AgentError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| AgentError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);

        let client = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(write_half),
            executing: Arc::new(Mutex::new(VecDeque::new())),
        };

        let executing = client.executing.clone();
        let path_owned = path.to_path_buf();
        tokio::spawn(read_loop(reader, executing, bus, path_owned));

        Ok(client)
    }

    pub async fn log_in(&self, user: &str) -> Result<(), AgentError> {
        self.send("login", &format!("LOGIN {user}")).await
    }

    pub async fn log_out(&self) -> Result<(), AgentError> {
        self.send("logout", "LOGOUT").await
    }

    async fn send(&self, name: &str, line: &str) -> Result<(), AgentError> {
        {
            let mut executing = self.executing.lock().await;
            executing.push_back(PendingCommand {
                name: name.to_string(),
            });
        }
        let mut writer = self.writer.lock().await;
        trace!(command = %line, "vmop agent >>");
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|source| AgentError::Write {
                path: self.path.clone(),
                source,
            })?;
        writer
            .write_all(b"\r\n")
            .await
            .map_err(|source| AgentError::Write {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

async fn read_loop(
    mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    executing: Arc<Mutex<VecDeque<PendingCommand>>>,
    bus: Bus,
    path: PathBuf,
) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        trace!(line = %trimmed, "vmop agent <<");

        let Some((code, rest)) = parse_reply(trimmed) else {
            warn!(line = %trimmed, "malformed vmop agent reply, ignoring");
            continue;
        };

        match code {
            220 => bus.publish(Event::VmopAgentConnected),
            100..=199 => {}
            201 => {
                let pending = executing.lock().await.pop_front();
                let user = pending
                    .map(|_| rest.to_string())
                    .unwrap_or_else(|| rest.to_string());
                bus.publish(Event::VmopAgentLoggedIn { user });
            }
            202 => {
                executing.lock().await.pop_front();
                bus.publish(Event::VmopAgentLoggedOut);
            }
            _ => {
                let pending = executing.lock().await.pop_front();
                let command = pending.map(|p| p.name).unwrap_or_default();
                bus.publish(Event::VmopAgentResult(VmopAgentResult {
                    command,
                    successful: false,
                    message: rest.to_string(),
                }));
            }
        }
    }

    executing.lock().await.clear();
    debug!(path = %path.display(), "vmop agent socket closed");
}

fn parse_reply(line: &str) -> Option<(u16, &str)> {
    let (code_str, rest) = line.split_at(line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len()));
    if code_str.len() != 3 {
        return None;
    }
    let code: u16 = code_str.parse().ok()?;
    Some((code, rest.trim_start_matches([' ', '-'])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::UnixListener;

    #[test]
    fn parses_greeting() {
        assert_eq!(parse_reply("220 vmop-agent ready"), Some((220, "vmop-agent ready")));
    }

    #[test]
    fn parses_login_confirmation() {
        assert_eq!(parse_reply("201 alice"), Some((201, "alice")));
    }

    #[test]
    fn rejects_malformed_line() {
        assert_eq!(parse_reply("not a reply"), None);
    }

    #[tokio::test]
    async fn connect_publishes_connected_and_login_events() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("vmop.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_, mut write_half) = stream.into_split();
            write_half.write_all(b"220 ready\r\n").await.unwrap();
            write_half.write_all(b"201 alice\r\n").await.unwrap();
        });

        let bus = Bus::new();
        let mut receiver = bus.subscribe();
        let _client = VmopAgentClient::connect(&socket_path, bus.clone()).await.unwrap();

        assert!(matches!(receiver.recv().await.unwrap(), Event::VmopAgentConnected));
        match receiver.recv().await.unwrap() {
            Event::VmopAgentLoggedIn { user } => assert_eq!(user, "alice"),
            other => panic!("expected VmopAgentLoggedIn, got {other:?}"),
        }
    }
}
