//! Cluster Custom Resource Definition
//!
//! A Cluster names the vCenter endpoint and credentials its machines are
//! provisioned against, and lists the API endpoints of its control plane once
//! one is reachable.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::provider_config::VsphereClusterProviderConfig;
use super::types::{preserve_unknown_fields, ApiEndpoint, ProviderSpec};
use crate::Result;

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// vSphere provider configuration (`VsphereClusterProviderConfig`)
    #[serde(default)]
    pub provider_spec: ProviderSpec,
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Reachable Kubernetes API endpoints, empty until the first control plane is up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<ApiEndpoint>,

    /// Provider-owned status blob (`VsphereClusterProviderStatus`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub provider_status: Option<serde_json::Value>,
}

impl Cluster {
    /// Decode the vSphere provider config
    pub fn provider_config(&self) -> Result<VsphereClusterProviderConfig> {
        self.spec.provider_spec.decode(&self.name_any())
    }

    /// Whether any API endpoint has been published for this cluster
    pub fn has_api_endpoint(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| !s.api_endpoints.is_empty())
    }
}
