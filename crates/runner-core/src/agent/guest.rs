use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, Event};
use crate::error::AgentError;

/// Client for the QEMU guest agent, a JSON-lines protocol over a
/// virtio-serial port distinct from the QMP monitor. The runner only ever
/// issues `guest-get-osinfo`, fired once per `VserportChangeEvent{open: true}`
/// for the guest-agent channel.
pub struct GuestAgentClient {
    path: PathBuf,
}

impl GuestAgentClient {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Connect, request `guest-get-osinfo`, publish `Event::OsInfo` with the
    /// result, then close. A fresh connection is made for each request since
    /// the guest agent socket may not tolerate overlapping outstanding calls
    /// across reconnect boundaries.
    pub async fn query_os_info(&self, bus: Bus) {
        match self.query_os_info_inner().await {
            Ok(info) => bus.publish(Event::OsInfo(info)),
            Err(source) => warn!(path = %self.path.display(), error = %source, "guest agent query failed"),
        }
    }

    async fn query_os_info_inner(&self) -> Result<Value, AgentError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| AgentError::Connect {
                path: self.path.clone(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = json!({ "execute": "guest-get-osinfo" });
        let line = serde_json::to_string(&request)
            .map_err(|source| AgentError::MalformedResponse {
                detail: source.to_string(),
            })?;
        trace!(command = %line, "guest agent >>");
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(|source| AgentError::Connect {
                path: self.path.clone(),
                source,
            })?;
        write_half
            .write_all(b"\n")
            .await
            .map_err(|source| AgentError::Connect {
                path: self.path.clone(),
                source,
            })?;

        let mut response_line = String::new();
        let n = reader
            .read_line(&mut response_line)
            .await
            .map_err(|_| AgentError::Closed {
                path: self.path.clone(),
            })?;
        if n == 0 {
            return Err(AgentError::Closed {
                path: self.path.clone(),
            });
        }

        let value: Value =
            serde_json::from_str(response_line.trim_end()).map_err(|source| {
                AgentError::MalformedResponse {
                    detail: source.to_string(),
                }
            })?;
        debug!(path = %self.path.display(), "guest agent responded to guest-get-osinfo");
        value
            .get("return")
            .cloned()
            .ok_or_else(|| AgentError::MalformedResponse {
                detail: "response had no `return` field".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn query_os_info_publishes_event_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("guest-agent.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.contains("guest-get-osinfo"));
            write_half
                .write_all(b"{\"return\": {\"id\": \"linux\", \"kernel-version\": \"6.1\"}}\n")
                .await
                .unwrap();
        });

        let bus = Bus::new();
        let mut receiver = bus.subscribe();
        let client = GuestAgentClient::new(socket_path);
        client.query_os_info(bus).await;

        match receiver.recv().await.unwrap() {
            Event::OsInfo(info) => assert_eq!(info.get("id").and_then(Value::as_str), Some("linux")),
            other => panic!("expected OsInfo, got {other:?}"),
        }
    }
}
