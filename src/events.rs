//! Kubernetes Events for machine lifecycle transitions
//!
//! Every transition the provisioner makes is described by a [`MachineEvent`],
//! which knows its own reason, action, severity, and note. Publishing is
//! fire-and-forget: a failed event is logged and never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::vsphere::MoRef;

/// Event reason strings
pub mod reasons {
    /// A clone was submitted
    pub const CREATING: &str = "Creating";
    /// The clone finished and the VM exists
    pub const CREATED: &str = "Created";
    /// The clone failed; the next pass starts over
    pub const CREATE_FAILED: &str = "CreateFailed";
    /// A non-clone task failed; it is resubmitted on a later pass
    pub const TASK_FAILED: &str = "TaskFailed";
    /// A reconfigure finished
    pub const RECONFIGURED: &str = "Reconfigured";
    /// The guest reported an IP address
    pub const IP_DETECTED: &str = "IPDetected";
    /// A stopped VM is being started again
    pub const POWERING_ON: &str = "PoweringOn";
    /// Teardown started
    pub const DELETING: &str = "Deleting";
    /// The VM is gone
    pub const DELETED: &str = "Deleted";
}

/// Which entry point of the provisioner produced an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// `create`
    Provision,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

impl Phase {
    /// Event action string
    pub fn action(self) -> &'static str {
        match self {
            Phase::Provision => "Provision",
            Phase::Update => "Update",
            Phase::Delete => "Delete",
        }
    }
}

/// A lifecycle transition of one Machine's VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachineEvent {
    /// A clone of `template` was submitted
    CloneSubmitted {
        /// Template name or path as configured
        template: String,
    },
    /// The clone produced `vm`
    Cloned {
        /// The new VM
        vm: MoRef,
    },
    /// The clone task failed
    CloneFailed {
        /// Server's error message
        message: String,
    },
    /// A power or destroy task failed
    TaskFailed {
        /// Entry point that was polling the task
        phase: Phase,
        /// Operation id of the task
        operation: String,
        /// Server's error message
        message: String,
    },
    /// A reconfigure task finished
    Reconfigured {
        /// Entry point that was polling the task
        phase: Phase,
        /// Entity the task ran against
        entity: String,
    },
    /// The guest reported `ip`
    IpDetected {
        /// The VM
        vm: MoRef,
        /// Guest IP address
        ip: String,
    },
    /// A power-on was submitted for a stopped VM
    PoweringOn {
        /// The VM
        vm: MoRef,
    },
    /// A power-off was submitted as the first teardown step
    PoweringOff {
        /// The VM
        vm: MoRef,
    },
    /// The VM no longer exists
    Deleted {
        /// The VM
        vm: MoRef,
    },
}

impl MachineEvent {
    /// Normal or Warning
    pub fn type_(&self) -> EventType {
        match self {
            Self::CloneFailed { .. } | Self::TaskFailed { .. } => EventType::Warning,
            _ => EventType::Normal,
        }
    }

    /// Whether this is a Warning event
    pub fn is_warning(&self) -> bool {
        matches!(self.type_(), EventType::Warning)
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CloneSubmitted { .. } => reasons::CREATING,
            Self::Cloned { .. } => reasons::CREATED,
            Self::CloneFailed { .. } => reasons::CREATE_FAILED,
            Self::TaskFailed { .. } => reasons::TASK_FAILED,
            Self::Reconfigured { .. } => reasons::RECONFIGURED,
            Self::IpDetected { .. } => reasons::IP_DETECTED,
            Self::PoweringOn { .. } => reasons::POWERING_ON,
            Self::PoweringOff { .. } => reasons::DELETING,
            Self::Deleted { .. } => reasons::DELETED,
        }
    }

    /// The provisioner entry point this event belongs to
    pub fn phase(&self) -> Phase {
        match self {
            Self::CloneSubmitted { .. } | Self::Cloned { .. } | Self::CloneFailed { .. } => {
                Phase::Provision
            }
            Self::TaskFailed { phase, .. } | Self::Reconfigured { phase, .. } => *phase,
            Self::IpDetected { .. } | Self::PoweringOn { .. } => Phase::Update,
            Self::PoweringOff { .. } | Self::Deleted { .. } => Phase::Delete,
        }
    }

    /// Human-readable message
    pub fn note(&self) -> String {
        match self {
            Self::CloneSubmitted { template } => format!("Cloning from template {template}"),
            Self::Cloned { vm } => format!("Created VM {vm}"),
            Self::CloneFailed { message } => format!("Clone failed: {message}"),
            Self::TaskFailed {
                operation, message, ..
            } => format!("{operation} failed: {message}"),
            Self::Reconfigured { entity, .. } => format!("Reconfigured VM {entity}"),
            Self::IpDetected { vm, ip } => format!("VM {vm} has IP address {ip}"),
            Self::PoweringOn { vm } => format!("Powering on VM {vm}"),
            Self::PoweringOff { vm } => format!("Powering off VM {vm}"),
            Self::Deleted { vm } => format!("Deleted VM {vm}"),
        }
    }
}

/// Records machine lifecycle events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against the Machine referenced by `machine`
    async fn publish(&self, machine: &ObjectReference, event: MachineEvent);
}

/// Publishes through `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, machine: &ObjectReference, event: MachineEvent) {
        let reason = event.reason();
        let kube_event = Event {
            type_: event.type_(),
            reason: reason.to_string(),
            note: Some(event.note()),
            action: event.phase().action().to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&kube_event, machine).await {
            warn!(
                machine = machine.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "failed to publish machine event"
            );
        }
    }
}
