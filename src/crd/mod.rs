//! Custom Resource Definitions for the vSphere provisioner
//!
//! `Machine` and `Cluster` follow the `cluster.k8s.io/v1alpha1` shape; the
//! vSphere-specific parts live in their provider config and status blobs.

mod cluster;
mod machine;
mod provider_config;
mod provider_status;
mod types;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use machine::{
    Machine, MachineAddress, MachineBootstrap, MachineSpec, MachineStatus, MachineVersionInfo,
    BOOTSTRAP_SECRET_SUFFIX,
};
pub use provider_config::{
    DiskRequest, DiskSpec, MachineSettings, VsphereClusterProviderConfig,
    VsphereMachineProviderConfig, VsphereMachineSpec, VAR_DATACENTER, VAR_DATASTORE,
    VAR_DISK_LABEL, VAR_DISK_SIZE, VAR_MEMORY, VAR_NUM_CPUS, VAR_RESOURCE_POOL, VAR_TEMPLATE,
    VAR_VM_FOLDER,
};
pub use provider_status::{now_rfc3339, VsphereClusterProviderStatus, VsphereMachineProviderStatus};
pub use types::{ApiEndpoint, ProviderSpec, SecretRef};
