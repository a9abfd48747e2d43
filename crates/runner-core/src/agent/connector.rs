use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::bus::{Bus, Component, Event};

use super::{GuestAgentClient, VmopAgentClient};

/// Opens the two agent sockets the moment their virtio-serial channel comes
/// up (`VserportChangeEvent{open: true}`), rather than eagerly at startup —
/// QEMU only accepts a connection on these sockets once the guest-side
/// driver has attached to the port. The VM-operator agent connection is
/// retained (rather than dropped after connecting) since it owns the write
/// half used for any future outbound command.
pub struct AgentConnector {
    guest_agent_socket: PathBuf,
    vmop_agent_socket: PathBuf,
    vmop_client: Mutex<Option<Arc<VmopAgentClient>>>,
}

impl AgentConnector {
    pub fn new(guest_agent_socket: PathBuf, vmop_agent_socket: PathBuf) -> Self {
        Self {
            guest_agent_socket,
            vmop_agent_socket,
            vmop_client: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Component for AgentConnector {
    fn name(&self) -> &'static str {
        "agent-connector"
    }

    async fn handle(&self, event: &Event, bus: &Bus) {
        match event {
            Event::VserportChangeEvent { id, open: true } => {
                if id == "guestagent0" {
                    let client = GuestAgentClient::new(self.guest_agent_socket.clone());
                    let bus = bus.clone();
                    tokio::spawn(async move { client.query_os_info(bus).await });
                } else if id == "vmopagent0" {
                    match VmopAgentClient::connect(&self.vmop_agent_socket, bus.clone()).await {
                        Ok(client) => *self.vmop_client.lock().await = Some(Arc::new(client)),
                        Err(source) => warn!(error = %source, "failed to connect to vmop agent socket"),
                    }
                }
            }
            Event::VmopAgentLogIn { user } => {
                let client = self.vmop_client.lock().await.clone();
                if let Some(client) = client {
                    if let Err(source) = client.log_in(user).await {
                        warn!(error = %source, "failed to send login request to vmop agent");
                    }
                }
            }
            Event::VmopAgentLogOut => {
                let client = self.vmop_client.lock().await.clone();
                if let Some(client) = client {
                    if let Err(source) = client.log_out().await {
                        warn!(error = %source, "failed to send logout request to vmop agent");
                    }
                }
            }
            _ => {}
        }
    }
}
