use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bus::{Bus, Component, Event};
use crate::qmp::QmpHandle;

/// Pushes SPICE display credentials into QEMU as the operator rewrites the
/// watched password/expiry files, and withholds them until the VM-operator
/// agent confirms the configured user is logged in, when one is configured.
///
/// The watched `display-login` file doubles as the user-login switch and
/// the configured username: empty content or the literal `false` means no
/// login is required, any other content is the username that must be
/// logged in before a password is ever sent to QEMU.
pub struct DisplayController {
    qmp: QmpHandle,
    password_file: PathBuf,
    expiry_file: PathBuf,
    login_file: PathBuf,
    required_user: Mutex<Option<String>>,
    logged_in_user: Mutex<Option<String>>,
    last_password_sent: Mutex<Option<Vec<u8>>>,
}

impl DisplayController {
    pub fn new(qmp: QmpHandle, password_file: PathBuf, expiry_file: PathBuf, login_file: PathBuf) -> Self {
        Self {
            qmp,
            password_file,
            expiry_file,
            login_file,
            required_user: Mutex::new(None),
            logged_in_user: Mutex::new(None),
            last_password_sent: Mutex::new(None),
        }
    }

    async fn login_satisfied(&self) -> bool {
        match self.required_user.lock().await.clone() {
            None => true,
            Some(user) => self.logged_in_user.lock().await.as_deref() == Some(user.as_str()),
        }
    }

    /// Re-read the password file and, if its content differs from the last
    /// value actually sent to QEMU, issue `set_password` (followed by
    /// `expire_password` if an expiry is set) — unless a login is required
    /// and hasn't been confirmed yet, in which case the password is
    /// withheld entirely.
    async fn push_password(&self) {
        let Ok(bytes) = tokio::fs::read(&self.password_file).await else {
            return;
        };
        if bytes.is_empty() {
            return;
        }
        if !self.login_satisfied().await {
            debug!("withholding display password until VM-operator agent login is confirmed");
            return;
        }
        {
            let mut last = self.last_password_sent.lock().await;
            if last.as_deref() == Some(bytes.as_slice()) {
                return;
            }
            *last = Some(bytes.clone());
        }
        let Some(client) = self.qmp.read().await.clone() else {
            return;
        };
        let password = String::from_utf8_lossy(&bytes).trim().to_string();
        if let Err(source) = client.set_password("spice", &password).await {
            warn!(error = %source, "set_password failed");
            return;
        }
        if let Ok(text) = tokio::fs::read_to_string(&self.expiry_file).await {
            let expiry = text.trim().to_string();
            if !expiry.is_empty() {
                if let Err(source) = client.expire_password("spice", &expiry).await {
                    warn!(error = %source, "expire_password failed");
                }
            }
        }
    }

    async fn apply_login_config(&self, bus: &Bus) {
        let content = tokio::fs::read_to_string(&self.login_file).await.ok();
        let user = content.and_then(|text| {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
                None
            } else {
                Some(trimmed.to_string())
            }
        });

        let previous = {
            let mut required = self.required_user.lock().await;
            let previous = required.clone();
            *required = user.clone();
            previous
        };

        if user.is_none() && previous.is_some() {
            let had_login = self.logged_in_user.lock().await.is_some();
            if had_login {
                bus.publish(Event::VmopAgentLogOut);
            }
        } else {
            self.push_password().await;
        }
    }
}

#[async_trait]
impl Component for DisplayController {
    fn name(&self) -> &'static str {
        "display-controller"
    }

    async fn handle(&self, event: &Event, bus: &Bus) {
        match event {
            Event::FileCreated(path) | Event::FileChanged(path) => {
                if *path == self.password_file || *path == self.expiry_file {
                    self.push_password().await;
                } else if *path == self.login_file {
                    self.apply_login_config(bus).await;
                }
            }
            Event::VmopAgentConnected => {
                let user = self.required_user.lock().await.clone();
                if let Some(user) = user {
                    bus.publish(Event::VmopAgentLogIn { user });
                }
            }
            Event::VmopAgentLoggedIn { user } => {
                *self.logged_in_user.lock().await = Some(user.clone());
                bus.publish(Event::ObserveUserLoggedIn(Some(user.clone())));
                self.push_password().await;
            }
            Event::VmopAgentLoggedOut => {
                *self.logged_in_user.lock().await = None;
                bus.publish(Event::ObserveUserLoggedIn(None));
            }
            Event::SpiceConnected { .. } => bus.publish(Event::ObserveConsoleConnected(true)),
            Event::SpiceDisconnected { .. } => bus.publish(Event::ObserveConsoleConnected(false)),
            _ => {}
        }
    }
}
