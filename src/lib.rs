//! vSphere machine provisioner - reconciles Cluster API Machines into vSphere VMs
//!
//! The provisioner turns a declarative `Machine` into a cloned virtual machine on a
//! vCenter endpoint and reflects the hypervisor's state back into the Machine's
//! annotations and provider status.
//!
//! # Architecture
//!
//! Provisioning never blocks on the hypervisor. A clone is submitted, its task
//! reference is persisted on the Machine, and every later reconcile polls that task
//! until it reaches a terminal state:
//!
//! ```text
//! controller -> provisioner::create
//!                 |- session::SessionManager   (cached, liveness-checked login)
//!                 |- task::poll_task           (in-flight task? poll it)
//!                 |- clone_spec                (else build a clone spec)
//!                 |- vsphere::VsphereSession   (submit clone)
//!                 '- status                    (persist task / VM reference)
//! ```
//!
//! # Modules
//!
//! - [`crd`] - Machine and Cluster resources plus vSphere provider config/status
//! - [`session`] - Authenticated session cache keyed by endpoint and identity
//! - [`clone_spec`] - Placement resolution and clone spec construction
//! - [`task`] - Hypervisor task state machine
//! - [`status`] - Provider status and annotation persistence
//! - [`provisioner`] - Create/update/delete orchestration
//! - [`bootstrap`] - Bootstrap data collaborator
//! - [`vsphere`] - Hypervisor API abstraction and JSON API client
//! - [`controller`] - kube-runtime reconcile glue
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Provisioner configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod clone_spec;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod provisioner;
pub mod session;
pub mod status;
pub mod task;
pub mod telemetry;
pub mod vsphere;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Machine annotations
// =============================================================================

/// Annotation holding the guest IP address of the provisioned VM
pub const ANNOTATION_VM_IP: &str = "vm-ip-address";

/// Annotation mirroring `spec.versions.controlPlane` once the VM is up
pub const ANNOTATION_CONTROL_PLANE_VERSION: &str = "control-plane-version";

/// Annotation mirroring `spec.versions.kubelet` once the VM is up
pub const ANNOTATION_KUBELET_VERSION: &str = "kubelet-version";

/// Annotation holding the managed object id of the provisioned VM
pub const ANNOTATION_VM_REF: &str = "vm-moid";

/// Annotation holding the in-flight hypervisor task, if any
pub const ANNOTATION_TASK_REF: &str = "current-task-ref";

// =============================================================================
// Labels and finalizers
// =============================================================================

/// Label naming the Cluster a Machine belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";

/// Label marking a Machine as a control plane member
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Legacy role label; the value `controlplane` marks a control plane member
pub const ROLE_SET_LABEL: &str = "set";

/// Finalizer guarding VM teardown before a Machine is removed
pub const MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";

/// Field manager used for server-side patches
pub const DEFAULT_FIELD_MANAGER: &str = "vsphere-provisioner";
