//! Hypervisor API abstraction
//!
//! The engine talks to vCenter only through [`VsphereSession`] and obtains
//! sessions through [`VsphereConnector`]. [`rest`] implements both over the
//! vSphere JSON API; tests use the generated mocks.

pub mod rest;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::session::{Credentials, Endpoint};
use crate::Result;

pub use types::{
    CloneSpec, Datacenter, DiskResize, MoRef, PowerState, RelocateSpec, TaskInfo, TaskResult,
    TaskState, TemplateProperties, VAppProperty, VAppPropertyEdit, VirtualDisk, VmConfigSpec,
    VmRuntime, DISK_MOVE_ALLOW_SHARING, KIND_DATACENTER, KIND_DATASTORE, KIND_FOLDER,
    KIND_RESOURCE_POOL, KIND_TASK, KIND_VIRTUAL_MACHINE,
};

/// An authenticated connection to one vCenter endpoint
///
/// Finder methods take a name or inventory path; an empty string selects the
/// default object, which exists only when exactly one candidate is present.
/// Lookups that can legitimately miss return `Ok(None)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VsphereSession: Send + Sync {
    /// Cheap round-trip reporting whether the server still honours this session
    async fn is_active(&self) -> Result<bool>;

    /// End the session on the server
    async fn logout(&self) -> Result<()>;

    /// Resolve a datacenter
    async fn find_datacenter(&self, path: &str) -> Result<Datacenter>;

    /// Resolve a VM folder, the datacenter's root VM folder when `path` is empty
    async fn find_folder(&self, datacenter: &Datacenter, path: &str) -> Result<MoRef>;

    /// Resolve a datastore
    async fn find_datastore(&self, datacenter: &Datacenter, path: &str) -> Result<MoRef>;

    /// Resolve a resource pool
    async fn find_resource_pool(&self, datacenter: &Datacenter, path: &str) -> Result<MoRef>;

    /// Find a VM or template by name or inventory path
    async fn find_vm(&self, datacenter: &Datacenter, path: &str) -> Result<Option<MoRef>>;

    /// Find a VM or template by instance UUID
    async fn find_vm_by_instance_uuid(
        &self,
        datacenter: &Datacenter,
        uuid: &str,
    ) -> Result<Option<MoRef>>;

    /// Read the disks and vApp schema of a template
    async fn template_properties(&self, template: &MoRef) -> Result<TemplateProperties>;

    /// Read power state and guest IP, `None` if the VM no longer exists
    async fn vm_runtime(&self, vm: &MoRef) -> Result<Option<VmRuntime>>;

    /// Read a task, `None` if the server no longer knows it
    async fn task_info(&self, task: &MoRef) -> Result<Option<TaskInfo>>;

    /// Submit a clone and return its task
    async fn clone_vm(&self, template: &MoRef, spec: &CloneSpec) -> Result<MoRef>;

    /// Submit a power-on and return its task
    async fn power_on_vm(&self, vm: &MoRef) -> Result<MoRef>;

    /// Submit a power-off and return its task
    async fn power_off_vm(&self, vm: &MoRef) -> Result<MoRef>;

    /// Submit a destroy and return its task
    async fn destroy_vm(&self, vm: &MoRef) -> Result<MoRef>;
}

/// Opens authenticated sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VsphereConnector: Send + Sync {
    /// Log in to `endpoint` with `credentials`
    async fn login(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn VsphereSession>>;
}
