//! Hypervisor object model used by the provisioning engine
//!
//! These are the engine's view of vCenter objects, independent of the wire
//! format spoken by [`super::rest`].

use std::collections::BTreeMap;
use std::fmt;

/// Managed object type of a virtual machine
pub const KIND_VIRTUAL_MACHINE: &str = "VirtualMachine";
/// Managed object type of a task
pub const KIND_TASK: &str = "Task";
/// Managed object type of a folder
pub const KIND_FOLDER: &str = "Folder";
/// Managed object type of a datacenter
pub const KIND_DATACENTER: &str = "Datacenter";
/// Managed object type of a datastore
pub const KIND_DATASTORE: &str = "Datastore";
/// Managed object type of a resource pool
pub const KIND_RESOURCE_POOL: &str = "ResourcePool";

/// Disk move type used for every clone
pub const DISK_MOVE_ALLOW_SHARING: &str = "moveAllDiskBackingsAndAllowSharing";

/// Reference to a server-side managed object (e.g., `VirtualMachine:vm-42`)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MoRef {
    /// Managed object type
    pub kind: String,
    /// Managed object id
    pub value: String,
}

impl MoRef {
    /// Build a reference of the given type
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Reference to a task
    pub fn task(value: impl Into<String>) -> Self {
        Self::new(KIND_TASK, value)
    }

    /// Reference to a virtual machine
    pub fn vm(value: impl Into<String>) -> Self {
        Self::new(KIND_VIRTUAL_MACHINE, value)
    }

    /// Whether this references a virtual machine
    pub fn is_vm(&self) -> bool {
        self.kind == KIND_VIRTUAL_MACHINE
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// A datacenter and the inventory name used to build paths beneath it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datacenter {
    /// Datacenter reference
    pub reference: MoRef,
    /// Inventory path of the datacenter, without a leading slash
    pub path: String,
    /// The datacenter's root VM folder
    pub vm_folder: MoRef,
}

/// State of a hypervisor task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting to run
    Queued,
    /// Running
    Running,
    /// Finished successfully
    Success,
    /// Finished with an error
    Error,
    /// A state this provisioner does not know
    Unknown(String),
}

impl TaskState {
    /// Parse the server's state string
    pub fn parse(raw: &str) -> Self {
        match raw {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "success" => Self::Success,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Result payload of a finished task
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum TaskResult {
    /// No result
    #[default]
    None,
    /// A managed object reference (e.g., the VM created by a clone)
    Reference(MoRef),
    /// Any other payload, kept as its type name
    Other(String),
}

/// Snapshot of a hypervisor task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task reference value
    pub key: String,
    /// Operation identifier (e.g., `VirtualMachine.clone`)
    pub description_id: String,
    /// Name of the entity the task runs against
    pub entity_name: Option<String>,
    /// Current state
    pub state: TaskState,
    /// Result payload once succeeded
    pub result: TaskResult,
    /// Localized error message once failed
    pub error: Option<String>,
}

/// A virtual disk on a template
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualDisk {
    /// Device key
    pub key: i32,
    /// Device label (e.g., "Hard disk 1")
    pub label: String,
    /// Current capacity in bytes
    pub capacity_in_bytes: i64,
    /// Full device as read from the server; edits are applied on top of it
    pub device: serde_json::Value,
}

/// A vApp property declared by a template
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VAppProperty {
    /// Property key
    pub key: i32,
    /// Property id (e.g., `user-data`)
    pub id: String,
    /// Default value
    pub default_value: Option<String>,
}

/// Template properties the clone spec depends on
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplateProperties {
    /// Virtual disks
    pub disks: Vec<VirtualDisk>,
    /// vApp properties, `None` when the template has no vApp configuration
    pub vapp_properties: Option<Vec<VAppProperty>>,
}

/// Power state of a VM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    /// Powered on
    On,
    /// Powered off
    Off,
    /// Suspended
    Suspended,
}

/// Runtime view of a VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRuntime {
    /// VM name
    pub name: String,
    /// Power state
    pub power_state: PowerState,
    /// Primary guest IP reported by VMware Tools
    pub guest_ip: Option<String>,
}

/// Where a clone lands
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocateSpec {
    /// Target datastore
    pub datastore: MoRef,
    /// Target resource pool
    pub pool: MoRef,
    /// How disk backings are moved
    pub disk_move_type: String,
}

/// New value for a vApp property
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VAppPropertyEdit {
    /// Property key
    pub key: i32,
    /// Property id
    pub id: String,
    /// Value to set
    pub value: String,
}

/// A disk grown as part of the clone
#[derive(Clone, Debug, PartialEq)]
pub struct DiskResize {
    /// The template's device
    pub disk: VirtualDisk,
    /// New capacity in bytes
    pub capacity_in_bytes: i64,
}

/// Hardware and guest configuration applied to the clone
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmConfigSpec {
    /// Instance UUID of the new VM
    pub instance_uuid: Option<String>,
    /// vCPU count override
    pub num_cpus: Option<i32>,
    /// Memory override in MiB
    pub memory_mb: Option<i64>,
    /// VM annotation
    pub annotation: String,
    /// Expose stable disk UUIDs to the guest
    pub disk_uuid_enabled: bool,
    /// vApp property values
    pub vapp_properties: Vec<VAppPropertyEdit>,
    /// Extra config keys
    pub extra_config: BTreeMap<String, String>,
    /// Disk resizes
    pub disk_resizes: Vec<DiskResize>,
}

/// A request to instantiate a VM from a template
#[derive(Clone, Debug, PartialEq)]
pub struct CloneSpec {
    /// Name of the new VM
    pub name: String,
    /// Folder the new VM is placed in
    pub folder: MoRef,
    /// Datastore and resource pool
    pub location: RelocateSpec,
    /// Power the VM on once cloned
    pub power_on: bool,
    /// Configuration changes
    pub config: VmConfigSpec,
}
