use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::K8sError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MAX_CONFLICT_RETRIES: u32 = 16;

/// Talks to the in-cluster Kubernetes API server to read and patch the
/// `status` subresource of a `VirtualMachine` custom resource, and to emit
/// `events.k8s.io` Events. The service account token is re-read before
/// every request rather than cached, since kubelet rotates it underneath a
/// long-running pod.
pub struct K8sClient {
    http: reqwest::Client,
    api_server: String,
    namespace: String,
    group_version: &'static str,
    plural: &'static str,
    name: String,
}

impl K8sClient {
    pub fn in_cluster(namespace: String, name: String) -> Result<Self, K8sError> {
        let ca_path = PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt");
        let ca_pem = std::fs::read(&ca_path).map_err(|source| K8sError::ReadToken {
            path: ca_path,
            source,
        })?;
        let ca_cert = reqwest::Certificate::from_pem(&ca_pem).map_err(|source| K8sError::BuildClient { source })?;

        let host = std::env::var("KUBERNETES_SERVICE_HOST").unwrap_or_else(|_| "kubernetes.default.svc".to_string());
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let http = reqwest::Client::builder()
            .add_root_certificate(ca_cert)
            .build()
            .map_err(|source| K8sError::BuildClient { source })?;

        Ok(Self {
            http,
            api_server: format!("https://{host}:{port}"),
            namespace,
            group_version: "vmoperator.jdrupes.org/v1",
            plural: "virtualmachines",
            name,
        })
    }

    fn token(&self) -> Result<String, K8sError> {
        let path = PathBuf::from(SERVICE_ACCOUNT_DIR).join("token");
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|source| K8sError::ReadToken { path, source })
    }

    fn resource_url(&self) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/{}/{}",
            self.api_server, self.group_version, self.namespace, self.plural, self.name
        )
    }

    async fn get_resource(&self) -> Result<Value, K8sError> {
        let url = self.resource_url();
        let token = self.token()?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| K8sError::Request { url: url.clone(), source })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(K8sError::ApiError {
                status: status.as_u16(),
                url,
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|source| K8sError::Request { url, source })
    }

    /// Patch `status` with a JSON merge patch, retrying on 409 conflicts
    /// (another writer raced us) by re-reading and reapplying up to
    /// `MAX_CONFLICT_RETRIES` times.
    pub async fn patch_status(&self, status: Value) -> Result<(), K8sError> {
        let url = format!("{}/status", self.resource_url());

        for attempt in 0..MAX_CONFLICT_RETRIES {
            let token = self.token()?;
            let body = serde_json::json!({ "status": status });
            let response = self
                .http
                .patch(&url)
                .bearer_auth(token)
                .header("Content-Type", "application/merge-patch+json")
                .json(&body)
                .send()
                .await
                .map_err(|source| K8sError::Request { url: url.clone(), source })?;

            let status_code = response.status();
            if status_code.is_success() {
                return Ok(());
            }
            if status_code.as_u16() == 409 {
                warn!(attempt, "status patch conflicted, retrying");
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(K8sError::ApiError {
                status: status_code.as_u16(),
                url,
                body,
            });
        }
        Err(K8sError::ConflictRetriesExhausted {
            attempts: MAX_CONFLICT_RETRIES,
        })
    }

    /// Only patches if the condition's `status`/`reason` actually changed
    /// from what's currently recorded, avoiding a write storm of
    /// no-op status updates.
    pub async fn patch_status_if_changed(&self, desired: Value) -> Result<(), K8sError> {
        let current = self.get_resource().await?;
        let current_status = current.get("status").cloned().unwrap_or(Value::Null);
        if current_status == desired {
            debug!("status unchanged, skipping patch");
            return Ok(());
        }
        self.patch_status(desired).await
    }

    pub async fn emit_event(&self, reason: &str, message: &str, event_type: &str) -> Result<(), K8sError> {
        let url = format!("{}/apis/events.k8s.io/v1/namespaces/{}/events", self.api_server, self.namespace);
        let token = self.token()?;
        let now = chrono::Utc::now().to_rfc3339();
        let body = serde_json::json!({
            "apiVersion": "events.k8s.io/v1",
            "kind": "Event",
            "metadata": { "generateName": format!("{}-", self.name) },
            "regarding": {
                "apiVersion": self.group_version,
                "kind": "VirtualMachine",
                "name": self.name,
                "namespace": self.namespace,
            },
            "reason": reason,
            "note": message,
            "type": event_type,
            "eventTime": now,
            "reportingController": "vmoperator.jdrupes.org/runner",
            "reportingInstance": self.name,
            "action": reason,
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|source| K8sError::Request { url: url.clone(), source })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(K8sError::ApiError { status, url, body });
        }
        Ok(())
    }
}
