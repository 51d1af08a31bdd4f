//! Provisioner configuration
//!
//! Values arrive from the command line (see `main.rs`) and are threaded into the
//! provisioner, the session connector, and the controller.

use std::time::Duration;

use crate::DEFAULT_FIELD_MANAGER;

/// Upper bound for a single hypervisor round-trip
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to wait before polling a queued or running task again
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait when a collaborator (cluster endpoint, bootstrap data) is not ready
pub const DEFAULT_NOT_READY_REQUEUE: Duration = Duration::from_secs(20);

/// Resync interval for machines that are fully provisioned
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Runtime settings for the provisioning engine
#[derive(Clone, Debug)]
pub struct ProvisionerConfig {
    /// Timeout applied to every hypervisor request
    pub api_timeout: Duration,
    /// Delay returned while a hypervisor task is queued or running
    pub task_poll_interval: Duration,
    /// Delay returned while a collaborator is not ready
    pub not_ready_requeue: Duration,
    /// Resync interval once a machine is provisioned
    pub resync_interval: Duration,
    /// Field manager for Kubernetes patches
    pub field_manager: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            api_timeout: DEFAULT_API_TIMEOUT,
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            not_ready_requeue: DEFAULT_NOT_READY_REQUEUE,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}
