use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, Event};
use crate::bus::event::MonitorResult;
use crate::error::QmpError;

use super::messages::{classify, Command, Line};
use super::QmpHandle;

/// In-flight command awaiting its response. A command is popped from the
/// QMP `executing` queue exactly when its matching response arrives, in
/// FIFO order.
struct PendingCommand {
    name: String,
}

/// Bi-directional JSON-lines client over a Unix socket to QEMU's monitor
/// `connect` performs the greeting/`qmp_capabilities`
/// handshake before returning.
pub struct QmpClient {
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    executing: Arc<Mutex<VecDeque<PendingCommand>>>,
}

impl QmpClient {
    /// Connect to `path`, complete the QMP handshake, and spawn a
    /// background task that reads responses/events and publishes them onto
    /// `bus`. The background task runs until the socket closes, at which
    /// point it publishes `Event::QmpClosed`.
    ///
    /// `handle` is populated with the new client, under its write lock,
    /// before `Event::QmpReady` is published — so a component that reacts to
    /// `QmpReady` by reading `handle` can never observe it still empty.
    pub async fn connect(path: &Path, bus: Bus, handle: QmpHandle) -> Result<Arc<Self>, QmpError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| QmpError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let greeting = read_line_value(&mut reader, path).await?;
        match classify(&greeting) {
            Some(Line::Greeting) => {}
            _ => {
                return Err(QmpError::Handshake {
                    detail: "expected QMP greeting as first line".to_string(),
                });
            }
        }

        let client = Arc::new(Self {
            writer: Mutex::new(write_half),
            executing: Arc::new(Mutex::new(VecDeque::new())),
        });

        client.send(Command::new("qmp_capabilities")).await?;
        let response = read_line_value(&mut reader, path).await?;
        match classify(&response) {
            Some(Line::Response { error: Some(e), .. }) => {
                return Err(QmpError::Handshake {
                    detail: format!("qmp_capabilities rejected: {}", e.desc),
                });
            }
            Some(Line::Response { .. }) => {}
            _ => {
                return Err(QmpError::Handshake {
                    detail: "expected response to qmp_capabilities".to_string(),
                });
            }
        }

        *handle.write().await = Some(client.clone());
        debug!(path = %path.display(), "QMP handshake complete");
        bus.publish(Event::QmpReady);

        let executing = client.executing.clone();
        let path_owned = path.to_path_buf();
        tokio::spawn(read_loop(reader, executing, bus, path_owned));

        Ok(client)
    }

    /// Issue a command. The response arrives asynchronously as an
    /// `Event::MonitorResult` published by the background read loop; this
    /// method only performs the write side of the FIFO queue; the
    /// `executing` queue is synchronised against concurrent writes.
    pub async fn execute(&self, command: Command) -> Result<(), QmpError> {
        self.send(command).await
    }

    async fn send(&self, command: Command) -> Result<(), QmpError> {
        let name = command.execute.clone();
        let line = serde_json::to_string(&command).map_err(|source| QmpError::Serialize {
            command: name.clone(),
            source,
        })?;

        {
            let mut executing = self.executing.lock().await;
            executing.push_back(PendingCommand { name: name.clone() });
        }

        let mut writer = self.writer.lock().await;
        trace!(command = %line, "QMP >>");
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|source| QmpError::Write { source })?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|source| QmpError::Write { source })?;
        Ok(())
    }

    pub async fn device_add(&self, driver: &str, id: &str, props: Value) -> Result<(), QmpError> {
        let mut arguments = props;
        if let Value::Object(ref mut map) = arguments {
            map.insert("driver".to_string(), json!(driver));
            map.insert("id".to_string(), json!(id));
        }
        self.execute(Command::with_arguments("device_add", arguments))
            .await
    }

    pub async fn device_del(&self, id: &str) -> Result<(), QmpError> {
        self.execute(Command::with_arguments("device_del", json!({ "id": id })))
            .await
    }

    pub async fn query_hotpluggable_cpus(&self) -> Result<(), QmpError> {
        self.execute(Command::new("query-hotpluggable-cpus")).await
    }

    pub async fn balloon(&self, value: u64) -> Result<(), QmpError> {
        self.execute(Command::with_arguments("balloon", json!({ "value": value })))
            .await
    }

    pub async fn system_powerdown(&self) -> Result<(), QmpError> {
        self.execute(Command::new("system_powerdown")).await
    }

    pub async fn cont(&self) -> Result<(), QmpError> {
        self.execute(Command::new("cont")).await
    }

    pub async fn stop(&self) -> Result<(), QmpError> {
        self.execute(Command::new("stop")).await
    }

    pub async fn quit(&self) -> Result<(), QmpError> {
        self.execute(Command::new("quit")).await
    }

    pub async fn blockdev_open_tray(&self, id: &str) -> Result<(), QmpError> {
        self.execute(Command::with_arguments(
            "blockdev-open-tray",
            json!({ "id": id }),
        ))
        .await
    }

    pub async fn blockdev_change_medium(&self, id: &str, filename: &str) -> Result<(), QmpError> {
        self.execute(Command::with_arguments(
            "blockdev-change-medium",
            json!({ "id": id, "filename": filename }),
        ))
        .await
    }

    pub async fn blockdev_remove_medium(&self, id: &str) -> Result<(), QmpError> {
        self.execute(Command::with_arguments(
            "blockdev-remove-medium",
            json!({ "id": id }),
        ))
        .await
    }

    pub async fn set_password(&self, protocol: &str, password: &str) -> Result<(), QmpError> {
        self.execute(Command::with_arguments(
            "set_password",
            json!({ "protocol": protocol, "password": password }),
        ))
        .await
    }

    pub async fn expire_password(&self, protocol: &str, time: &str) -> Result<(), QmpError> {
        self.execute(Command::with_arguments(
            "expire_password",
            json!({ "protocol": protocol, "time": time }),
        ))
        .await
    }
}

async fn read_line_value(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    path: &Path,
) -> Result<Value, QmpError> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|_| QmpError::Closed {
            path: path.to_path_buf(),
        })?;
    if n == 0 {
        return Err(QmpError::Closed {
            path: path.to_path_buf(),
        });
    }
    serde_json::from_str(line.trim_end()).map_err(|source| QmpError::MalformedLine {
        detail: format!("{source}: {line:?}"),
    })
}

/// Background task: reads lines from the socket for the lifetime of the
/// connection, demultiplexing responses (matched FIFO against `executing`)
/// and async events into typed bus events.
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
        trace!(line = %trimmed, "QMP <<");

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(source) => {
                warn!(error = %source, line = %trimmed, "malformed QMP line, ignoring");
                continue;
            }
        };

        match classify(&value) {
            Some(Line::Response { result, error }) => {
                let pending = executing.lock().await.pop_front();
                let Some(pending) = pending else {
                    // Dangling response with no matching command: discard
                    // without synthesizing an error.
                    continue;
                };
                let successful = error.is_none();
                let error_message = error.map(|e| e.desc);
                bus.publish(Event::MonitorResult(MonitorResult {
                    command: pending.name,
                    successful,
                    value: result.unwrap_or(Value::Null),
                    error_message,
                }));
            }
            Some(Line::Event(async_event)) => dispatch_async_event(async_event, &bus),
            Some(Line::Greeting) | None => {}
        }
    }

    // Dangling commands in the queue are discarded without synthesizing
    // errors.
    executing.lock().await.clear();
    debug!(path = %path.display(), "QMP socket closed");
    bus.publish(Event::QmpClosed);
}

fn dispatch_async_event(event: super::messages::AsyncEvent, bus: &Bus) {
    match event.event.as_str() {
        "POWERDOWN" => bus.publish(Event::PowerdownEvent),
        "DEVICE_TRAY_MOVED" => {
            let device = event
                .data
                .get("device")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let open = event
                .data
                .get("tray-open")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            bus.publish(Event::TrayMovedEvent { device, open });
        }
        "VSERPORT_CHANGE" => {
            let id = event
                .data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let open = event
                .data
                .get("open")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            bus.publish(Event::VserportChangeEvent { id, open });
        }
        "CPU_ADDED" => {
            let id = event
                .data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            bus.publish(Event::CpuAdded { id });
        }
        "CPU_DELETED" => {
            let id = event
                .data
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            bus.publish(Event::CpuDeleted { id });
        }
        "SPICE_CONNECTED" => {
            let client = event
                .data
                .get("client")
                .and_then(|c| c.get("connection-id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            bus.publish(Event::SpiceConnected { client });
        }
        "SPICE_DISCONNECTED" => {
            let client = event
                .data
                .get("client")
                .and_then(|c| c.get("connection-id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            bus.publish(Event::SpiceDisconnected { client });
        }
        other => trace!(event = other, "unhandled QMP event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::UnixListener;

    /// Spawns a fake QEMU monitor: sends the greeting, accepts
    /// `qmp_capabilities`, then echoes back `{"return": {}}` for every
    /// subsequent command and emits one `POWERDOWN` event.
    async fn fake_monitor(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        write_half.write_all(b"{\"return\": {}}\n").await.unwrap();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                break;
            }
            write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
            write_half
                .write_all(b"{\"event\": \"POWERDOWN\", \"data\": {}, \"timestamp\": {\"seconds\": 0, \"microseconds\": 0}}\n")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn connect_performs_handshake_and_publishes_qmp_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("monitor.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(fake_monitor(listener));

        let bus = Bus::new();
        let mut receiver = bus.subscribe();
        let handle = crate::qmp::new_handle();

        let client = QmpClient::connect(&socket_path, bus.clone(), handle.clone())
            .await
            .unwrap();
        assert!(matches!(receiver.recv().await.unwrap(), Event::QmpReady));
        assert!(handle.read().await.is_some());

        client.execute(Command::new("query-status")).await.unwrap();

        let mut saw_monitor_result = false;
        let mut saw_powerdown = false;
        for _ in 0..4 {
            match receiver.recv().await.unwrap() {
                Event::MonitorResult(result) => {
                    assert_eq!(result.command, "query-status");
                    assert!(result.successful);
                    saw_monitor_result = true;
                }
                Event::PowerdownEvent => saw_powerdown = true,
                _ => {}
            }
            if saw_monitor_result && saw_powerdown {
                break;
            }
        }
        assert!(saw_monitor_result);
        assert!(saw_powerdown);
    }

    #[tokio::test]
    async fn connect_fails_when_socket_has_no_listener() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("nonexistent.sock");
        let bus = Bus::new();
        let handle = crate::qmp::new_handle();
        let result = QmpClient::connect(&socket_path, bus, handle).await;
        assert!(result.is_err());
    }
}
