//! Machine Custom Resource Definition
//!
//! A Machine is one desired VM. Its provider config says where and how to clone
//! it; its provider status records what the provisioner has done so far.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::provider_config::VsphereMachineProviderConfig;
use super::types::{preserve_unknown_fields, ProviderSpec};
use crate::{Result, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, ROLE_SET_LABEL};

/// Suffix of the default bootstrap data Secret name
pub const BOOTSTRAP_SECRET_SUFFIX: &str = "-bootstrap";

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    shortname = "ma",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".metadata.labels.cluster\\.k8s\\.io/cluster-name"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".metadata.annotations.vm-ip-address"}"#,
    printcolumn = r#"{"name":"Kubelet","type":"string","jsonPath":".spec.versions.kubelet"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// vSphere provider configuration (`VsphereMachineProviderConfig`)
    #[serde(default)]
    pub provider_spec: ProviderSpec,

    /// Kubernetes component versions
    #[serde(default)]
    pub versions: MachineVersionInfo,

    /// Where to find the bootstrap payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<MachineBootstrap>,
}

/// Kubernetes versions requested for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Kubelet version
    #[serde(default)]
    pub kubelet: String,

    /// Control plane version; set only on control plane machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,
}

/// Bootstrap data source for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    /// Secret holding the payload under the `value` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Provider-owned status blob (`VsphereMachineProviderStatus`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,

    /// Addresses reported by the guest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
}

/// A network address of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Address kind (e.g., "InternalIP")
    #[serde(rename = "type")]
    pub type_: String,

    /// The address
    pub address: String,
}

impl Machine {
    /// Whether this machine hosts the Kubernetes control plane
    pub fn is_control_plane(&self) -> bool {
        self.labels().contains_key(CONTROL_PLANE_LABEL)
            || self.labels().get(ROLE_SET_LABEL).map(String::as_str) == Some("controlplane")
            || self
                .spec
                .versions
                .control_plane
                .as_deref()
                .is_some_and(|v| !v.is_empty())
    }

    /// Name of the owning Cluster, from the cluster-name label
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels()
            .get(CLUSTER_NAME_LABEL)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }

    /// Decode the vSphere provider config
    pub fn provider_config(&self) -> Result<VsphereMachineProviderConfig> {
        self.spec.provider_spec.decode(&self.name_any())
    }

    /// Name of the Secret holding this machine's bootstrap payload
    pub fn bootstrap_secret_name(&self) -> String {
        self.spec
            .bootstrap
            .as_ref()
            .and_then(|b| b.data_secret_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}{}", self.name_any(), BOOTSTRAP_SECRET_SUFFIX))
    }

    /// Value of an annotation, treating an empty string as absent
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
