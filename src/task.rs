//! Hypervisor task state machine
//!
//! A machine has at most one in-flight task, recorded as a [`TaskHandle`]. Each
//! reconcile polls it once and acts on the [`TaskOutcome`]:
//!
//! ```text
//! queued | running          -> Pending (poll again after the interval)
//! success + clone           -> Cloned(vm)      record the VM, clear the handle
//! success + anything else   -> Completed       clear the handle
//! error                     -> Reset(Failed)   clear the handle, start over
//! unknown to the server     -> Reset(NotFound) clear the handle, start over
//! any other state           -> protocol error
//! ```

use std::time::Duration;

use tracing::debug;

use crate::crd::{Machine, VsphereMachineProviderStatus};
use crate::vsphere::{MoRef, TaskInfo, TaskResult, TaskState, VsphereSession};
use crate::{Error, Result, ANNOTATION_TASK_REF};

/// Operation id of a clone
pub const OP_CLONE: &str = "VirtualMachine.clone";
/// Operation id of a reconfigure
pub const OP_RECONFIGURE: &str = "VirtualMachine.reconfigure";
/// Operation id of a power-off
pub const OP_POWER_OFF: &str = "VirtualMachine.powerOff";

/// Whether a machine has a hypervisor operation outstanding
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskHandle {
    /// Nothing in flight
    None,
    /// A task reference value (e.g., `task-1234`)
    InFlight(String),
}

impl TaskHandle {
    /// Read the handle from the task annotation, falling back to the provider status
    pub fn from_machine(machine: &Machine) -> Result<Self> {
        if let Some(task) = machine.annotation(ANNOTATION_TASK_REF) {
            return Ok(Self::InFlight(task.to_string()));
        }
        let from_status = VsphereMachineProviderStatus::from_machine(machine)?
            .map(|s| s.task_ref)
            .filter(|t| !t.is_empty());
        Ok(from_status.map_or(Self::None, Self::InFlight))
    }
}

/// Why a handle is being cleared without success
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResetReason {
    /// The task finished with an error
    Failed {
        /// Operation that failed
        operation: String,
        /// Server's error message
        message: String,
    },
    /// The server no longer knows the task
    NotFound,
}

/// What a poll of the in-flight task decided
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Still queued or running
    Pending {
        /// When to poll again
        retry_after: Duration,
    },
    /// A clone finished and produced this VM
    Cloned {
        /// The new VM
        vm: MoRef,
    },
    /// A non-clone operation finished
    Completed {
        /// Operation id
        operation: String,
        /// Entity the task ran against
        entity: Option<String>,
    },
    /// The handle must be cleared so the next pass starts over
    Reset(ResetReason),
}

/// Map a task snapshot to an outcome
pub fn classify(info: &TaskInfo, poll_interval: Duration) -> Result<TaskOutcome> {
    match &info.state {
        TaskState::Queued | TaskState::Running => Ok(TaskOutcome::Pending {
            retry_after: poll_interval,
        }),
        TaskState::Success if info.description_id == OP_CLONE => match &info.result {
            TaskResult::Reference(vm) if vm.is_vm() => Ok(TaskOutcome::Cloned { vm: vm.clone() }),
            other => Err(Error::protocol(format!(
                "clone task {} succeeded without a VirtualMachine result: {other:?}",
                info.key
            ))),
        },
        TaskState::Success => Ok(TaskOutcome::Completed {
            operation: info.description_id.clone(),
            entity: info.entity_name.clone(),
        }),
        TaskState::Error => Ok(TaskOutcome::Reset(ResetReason::Failed {
            operation: info.description_id.clone(),
            message: info
                .error
                .clone()
                .unwrap_or_else(|| "task failed without an error message".to_string()),
        })),
        TaskState::Unknown(state) => Err(Error::protocol(format!(
            "unknown state '{state}' for task {}",
            info.key
        ))),
    }
}

/// Poll one task
///
/// A task the server no longer knows is a reset, not an error: completed tasks
/// age out of the server's history.
pub async fn poll_task(
    session: &dyn VsphereSession,
    task: &str,
    poll_interval: Duration,
) -> Result<TaskOutcome> {
    match session.task_info(&MoRef::task(task)).await? {
        None => {
            debug!(task, "task no longer exists on the hypervisor");
            Ok(TaskOutcome::Reset(ResetReason::NotFound))
        }
        Some(info) => {
            debug!(task, state = %info.state, operation = %info.description_id, "polled task");
            classify(&info, poll_interval)
        }
    }
}
