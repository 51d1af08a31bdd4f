//! Bootstrap data collaborator
//!
//! The provisioner does not render cloud-init itself. It asks a
//! [`BootstrapDataSource`] for a base64 payload, and that source may answer
//! "not ready yet" with a delay, which the provisioner passes through unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::{Cluster, Machine};
use crate::status::{namespace_of, MachineStore};
use crate::{Error, Result};

/// Secret key holding the bootstrap payload
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Answer from a bootstrap data source
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapData {
    /// Base64-encoded payload
    Ready(String),
    /// A collaborator is not ready; ask again later
    NotReady {
        /// What is missing
        reason: String,
        /// When to ask again
        retry_after: Duration,
    },
}

/// Produces the startup payload for a machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapDataSource: Send + Sync {
    /// Bootstrap payload for `machine` in `cluster`
    async fn user_data(&self, cluster: &Cluster, machine: &Machine) -> Result<BootstrapData>;
}

/// Reads pre-rendered bootstrap data from a Secret
pub struct SecretBootstrapData {
    store: Arc<dyn MachineStore>,
    retry_after: Duration,
}

impl SecretBootstrapData {
    /// Create a source that asks callers to come back after `retry_after`
    pub fn new(store: Arc<dyn MachineStore>, retry_after: Duration) -> Self {
        Self { store, retry_after }
    }

    fn not_ready(&self, reason: impl Into<String>) -> BootstrapData {
        BootstrapData::NotReady {
            reason: reason.into(),
            retry_after: self.retry_after,
        }
    }
}

#[async_trait]
impl BootstrapDataSource for SecretBootstrapData {
    async fn user_data(&self, cluster: &Cluster, machine: &Machine) -> Result<BootstrapData> {
        let name = machine.name_any();

        // Workers join through the control plane endpoint.
        if !machine.is_control_plane() && !cluster.has_api_endpoint() {
            debug!(machine = %name, "cluster has no API endpoint yet");
            return Ok(self.not_ready("cluster has no API endpoint yet"));
        }

        let secret_name = machine.bootstrap_secret_name();
        let Some(secret) = self
            .store
            .get_secret(&namespace_of(machine), &secret_name)
            .await?
        else {
            return Ok(self.not_ready(format!(
                "bootstrap data secret {secret_name} not ready"
            )));
        };

        let payload = secret
            .data
            .as_ref()
            .and_then(|d| d.get(BOOTSTRAP_DATA_KEY))
            .ok_or_else(|| {
                Error::bootstrap(
                    &name,
                    format!("secret {secret_name} has no '{BOOTSTRAP_DATA_KEY}' key"),
                )
            })?;
        if payload.0.is_empty() {
            return Ok(self.not_ready(format!("bootstrap data secret {secret_name} is empty")));
        }
        Ok(BootstrapData::Ready(STANDARD.encode(&payload.0)))
    }
}
