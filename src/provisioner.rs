//! Machine provisioning orchestrator
//!
//! The [`Provisioner`] is the entry point the controller calls on every pass.
//! It never waits for the hypervisor: long-running operations are submitted,
//! their task reference is persisted on the Machine, and the pass returns
//! [`Reconciled::RetryAfter`]. The next pass polls the task and advances.
//!
//! Only one task may be outstanding per machine. While a handle is stored,
//! `create` and `delete` poll it and never submit another operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::{BootstrapData, BootstrapDataSource};
use crate::clone_spec::{build_clone_spec, resolve_placement, CloneInputs};
use crate::config::ProvisionerConfig;
use crate::crd::{
    Cluster, Machine, MachineSettings, VsphereClusterProviderConfig, VsphereMachineProviderStatus,
};
use crate::events::{EventPublisher, MachineEvent, Phase};
use crate::session::{Credentials, Endpoint, SessionManager};
use crate::status::{
    namespace_of, set_internal_ip, set_machine_ref, set_task_ref, touch_cluster_status,
    update_annotations, MachineStore,
};
use crate::task::{poll_task, ResetReason, TaskHandle, TaskOutcome, OP_CLONE, OP_RECONFIGURE};
use crate::vsphere::{MoRef, PowerState, VsphereSession};
use crate::{
    Error, Result, ANNOTATION_CONTROL_PLANE_VERSION, ANNOTATION_KUBELET_VERSION, ANNOTATION_VM_IP,
    ANNOTATION_VM_REF,
};

/// Secret key holding the vCenter user name
pub const CREDENTIAL_USERNAME_KEY: &str = "username";
/// Secret key holding the vCenter password
pub const CREDENTIAL_PASSWORD_KEY: &str = "password";

/// Result of one provisioning pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Nothing left to do on this pass
    Done,
    /// Call again after `delay`; this is progress, not a failure
    RetryAfter {
        /// When to call again
        delay: Duration,
        /// What is being waited for
        reason: String,
    },
}

impl Reconciled {
    /// Shorthand for [`Reconciled::RetryAfter`]
    pub fn retry_after(delay: Duration, reason: impl Into<String>) -> Self {
        Self::RetryAfter {
            delay,
            reason: reason.into(),
        }
    }
}

/// Marks a machine as being worked on by this process until dropped
struct Claim<'a> {
    set: &'a DashSet<String>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

/// Orchestrates VM lifecycle for Machines
pub struct Provisioner {
    sessions: SessionManager,
    store: Arc<dyn MachineStore>,
    bootstrap: Arc<dyn BootstrapDataSource>,
    events: Arc<dyn EventPublisher>,
    config: ProvisionerConfig,
    in_flight: DashSet<String>,
}

impl Provisioner {
    /// Create a provisioner from its collaborators
    pub fn new(
        sessions: SessionManager,
        store: Arc<dyn MachineStore>,
        bootstrap: Arc<dyn BootstrapDataSource>,
        events: Arc<dyn EventPublisher>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            sessions,
            store,
            bootstrap,
            events,
            config,
            in_flight: DashSet::new(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Ensure a VM exists for `machine`, submitting or polling the clone
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    pub async fn create(&self, cluster: &Cluster, machine: &mut Machine) -> Result<Reconciled> {
        let Some(_claim) = self.claim(machine) else {
            return Ok(self.busy());
        };
        let cluster_config = cluster.provider_config()?;
        let session = self.session_for(cluster, &cluster_config).await?;

        if let TaskHandle::InFlight(task) = TaskHandle::from_machine(machine)? {
            return Ok(self
                .settle_task(session.as_ref(), machine, &task, Phase::Provision)
                .await?
                .unwrap_or(Reconciled::Done));
        }

        self.submit_clone(session.as_ref(), cluster, &cluster_config, machine)
            .await
    }

    /// Whether the stored VM reference still resolves on the hypervisor
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    pub async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        let Some(vm) = vm_ref(machine)? else {
            return Ok(false);
        };
        let cluster_config = cluster.provider_config()?;
        let session = self.session_for(cluster, &cluster_config).await?;
        let found = session.vm_runtime(&vm).await?.is_some();
        debug!(vm = %vm, found, "checked VM existence");
        Ok(found)
    }

    /// Reflect the running VM into the Machine's annotations and addresses
    ///
    /// A VM found stopped is powered on again; the power-on is tracked through
    /// the task handle like any other operation.
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    pub async fn update(&self, cluster: &Cluster, machine: &mut Machine) -> Result<Reconciled> {
        let Some(_claim) = self.claim(machine) else {
            return Ok(self.busy());
        };
        let name = machine.name_any();
        let cluster_config = cluster.provider_config()?;
        let session = self.session_for(cluster, &cluster_config).await?;

        if let TaskHandle::InFlight(task) = TaskHandle::from_machine(machine)? {
            if let Some(wait) = self
                .settle_task(session.as_ref(), machine, &task, Phase::Update)
                .await?
            {
                return Ok(wait);
            }
        }

        let vm = vm_ref(machine)?.ok_or_else(|| {
            Error::internal_with_context("update", format!("machine {name} has no VM reference"))
        })?;
        let runtime = session
            .vm_runtime(&vm)
            .await?
            .ok_or_else(|| Error::hypervisor("update", format!("VM {vm} no longer exists")))?;
        if runtime.power_state != PowerState::On {
            info!(vm = %vm, state = ?runtime.power_state, "VM is not running; powering on");
            self.publish(machine, MachineEvent::PoweringOn { vm: vm.clone() })
                .await;
            let task = session.power_on_vm(&vm).await?;
            set_task_ref(self.store.as_ref(), machine, &task.value).await?;
            return Ok(Reconciled::retry_after(
                self.config.task_poll_interval,
                format!("power-on task {} submitted", task.value),
            ));
        }

        if machine.annotation(ANNOTATION_VM_IP).is_some() {
            return Ok(Reconciled::Done);
        }
        let Some(ip) = runtime.guest_ip.filter(|ip| !ip.is_empty()) else {
            debug!(vm = %vm, "guest has not reported an IP address yet");
            return Ok(Reconciled::retry_after(
                self.config.not_ready_requeue,
                format!("waiting for VM {vm} to report an IP address"),
            ));
        };

        let annotations = BTreeMap::from([
            (ANNOTATION_VM_IP.to_string(), Some(ip.clone())),
            (
                ANNOTATION_CONTROL_PLANE_VERSION.to_string(),
                Some(
                    machine
                        .spec
                        .versions
                        .control_plane
                        .clone()
                        .unwrap_or_default(),
                ),
            ),
            (
                ANNOTATION_KUBELET_VERSION.to_string(),
                Some(machine.spec.versions.kubelet.clone()),
            ),
            (ANNOTATION_VM_REF.to_string(), Some(vm.value.clone())),
        ]);
        update_annotations(self.store.as_ref(), machine, annotations).await?;
        set_internal_ip(self.store.as_ref(), machine, &ip).await?;
        touch_cluster_status(self.store.as_ref(), cluster).await?;

        info!(vm = %vm, ip = %ip, "VM reported an IP address");
        self.publish(machine, MachineEvent::IpDetected { vm, ip }).await;
        Ok(Reconciled::Done)
    }

    /// Tear the VM down: power off, then destroy, one task per pass
    #[instrument(skip(self, cluster, machine), fields(machine = %machine.name_any()))]
    pub async fn delete(&self, cluster: &Cluster, machine: &mut Machine) -> Result<Reconciled> {
        let Some(_claim) = self.claim(machine) else {
            return Ok(self.busy());
        };
        let cluster_config = cluster.provider_config()?;
        let session = self.session_for(cluster, &cluster_config).await?;

        if let TaskHandle::InFlight(task) = TaskHandle::from_machine(machine)? {
            if let Some(wait) = self
                .settle_task(session.as_ref(), machine, &task, Phase::Delete)
                .await?
            {
                return Ok(wait);
            }
        }

        let Some(vm) = vm_ref(machine)? else {
            debug!("no VM was ever recorded; nothing to delete");
            return Ok(Reconciled::Done);
        };

        let Some(runtime) = session.vm_runtime(&vm).await? else {
            set_machine_ref(self.store.as_ref(), machine, "").await?;
            info!(vm = %vm, "VM deleted");
            self.publish(machine, MachineEvent::Deleted { vm }).await;
            return Ok(Reconciled::Done);
        };

        let task = match runtime.power_state {
            PowerState::On | PowerState::Suspended => {
                self.publish(machine, MachineEvent::PoweringOff { vm: vm.clone() })
                    .await;
                session.power_off_vm(&vm).await?
            }
            PowerState::Off => session.destroy_vm(&vm).await?,
        };
        info!(vm = %vm, task = %task, "teardown task submitted");
        set_task_ref(self.store.as_ref(), machine, &task.value).await?;
        Ok(Reconciled::retry_after(
            self.config.task_poll_interval,
            format!("teardown task {} submitted", task.value),
        ))
    }

    fn claim(&self, machine: &Machine) -> Option<Claim<'_>> {
        let key = format!("{}/{}", namespace_of(machine), machine.name_any());
        if !self.in_flight.insert(key.clone()) {
            debug!(machine = %key, "another pass is already working on this machine");
            return None;
        }
        Some(Claim {
            set: &self.in_flight,
            key,
        })
    }

    fn busy(&self) -> Reconciled {
        Reconciled::retry_after(
            self.config.task_poll_interval,
            "another reconcile of this machine is in progress",
        )
    }

    async fn session_for(
        &self,
        cluster: &Cluster,
        config: &VsphereClusterProviderConfig,
    ) -> Result<Arc<dyn VsphereSession>> {
        let endpoint = Endpoint::parse(
            &config.vsphere_server,
            config.insecure,
            config.ca_cert_pem.clone(),
        )?;
        let credentials = self.credentials(cluster, config).await?;
        self.sessions.get_session(&endpoint, &credentials).await
    }

    async fn credentials(
        &self,
        cluster: &Cluster,
        config: &VsphereClusterProviderConfig,
    ) -> Result<Credentials> {
        if let Some(user) = config.vsphere_user.as_deref().filter(|u| !u.is_empty()) {
            return Ok(Credentials::new(
                user,
                config.vsphere_password.clone().unwrap_or_default(),
            ));
        }

        let cluster_name = cluster.name_any();
        let secret_ref = config.vsphere_credential_secret.as_ref().ok_or_else(|| {
            Error::configuration_for_field(
                &cluster_name,
                "spec.providerSpec.value.vsphereCredentialSecret",
                "neither vsphereUser nor vsphereCredentialSecret is set",
            )
        })?;
        let namespace = secret_ref
            .namespace
            .clone()
            .unwrap_or_else(|| namespace_of(cluster));
        let secret = self
            .store
            .get_secret(&namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| {
                Error::configuration_for(
                    &cluster_name,
                    format!("credential secret {namespace}/{} not found", secret_ref.name),
                )
            })?;

        let field = |key: &str| -> Result<String> {
            let bytes = secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .ok_or_else(|| {
                    Error::configuration_for(
                        &cluster_name,
                        format!("credential secret {} has no '{key}' key", secret_ref.name),
                    )
                })?;
            String::from_utf8(bytes.0.clone()).map_err(|_| {
                Error::configuration_for(
                    &cluster_name,
                    format!("credential secret {} key '{key}' is not UTF-8", secret_ref.name),
                )
            })
        };
        Ok(Credentials::new(
            field(CREDENTIAL_USERNAME_KEY)?,
            field(CREDENTIAL_PASSWORD_KEY)?,
        ))
    }

    /// Poll the in-flight task once
    ///
    /// Returns `Some` while the task is still running. Every terminal outcome
    /// clears the handle and returns `None`; a finished clone records its VM
    /// before the handle is cleared.
    async fn settle_task(
        &self,
        session: &dyn VsphereSession,
        machine: &mut Machine,
        task: &str,
        phase: Phase,
    ) -> Result<Option<Reconciled>> {
        match poll_task(session, task, self.config.task_poll_interval).await? {
            TaskOutcome::Pending { retry_after } => {
                debug!(task, "task still running");
                return Ok(Some(Reconciled::retry_after(
                    retry_after,
                    format!("waiting for task {task}"),
                )));
            }
            TaskOutcome::Cloned { vm } => {
                set_machine_ref(self.store.as_ref(), machine, &vm.value).await?;
                info!(task, vm = %vm, "clone finished");
                self.publish(machine, MachineEvent::Cloned { vm }).await;
            }
            TaskOutcome::Completed { operation, entity } => {
                info!(task, %operation, entity = ?entity, "task finished");
                if operation == OP_RECONFIGURE {
                    let entity = entity.unwrap_or_default();
                    self.publish(machine, MachineEvent::Reconfigured { phase, entity })
                        .await;
                }
            }
            TaskOutcome::Reset(ResetReason::Failed { operation, message }) => {
                warn!(task, %operation, error = %message, "task failed; starting over");
                let event = if operation == OP_CLONE {
                    MachineEvent::CloneFailed { message }
                } else {
                    MachineEvent::TaskFailed {
                        phase,
                        operation,
                        message,
                    }
                };
                self.publish(machine, event).await;
            }
            TaskOutcome::Reset(ResetReason::NotFound) => {
                info!(task, "task is unknown to the hypervisor; starting over");
            }
        }
        set_task_ref(self.store.as_ref(), machine, "").await?;
        Ok(None)
    }

    async fn submit_clone(
        &self,
        session: &dyn VsphereSession,
        cluster: &Cluster,
        cluster_config: &VsphereClusterProviderConfig,
        machine: &mut Machine,
    ) -> Result<Reconciled> {
        let name = machine.name_any();

        let user_data = match self.bootstrap.user_data(cluster, machine).await? {
            BootstrapData::Ready(data) => data,
            BootstrapData::NotReady {
                reason,
                retry_after,
            } => {
                debug!(%reason, "bootstrap data not ready");
                return Ok(Reconciled::RetryAfter {
                    delay: retry_after,
                    reason,
                });
            }
        };

        let settings = MachineSettings::resolve(&machine.provider_config()?, &name)?;
        let placement = resolve_placement(session, &settings, &name).await?;

        // A VM carrying this machine's UID is already ours, e.g. when the
        // task annotation write failed after a previous submission.
        let uid = machine.uid();
        if let Some(uid) = uid.as_deref() {
            if let Some(vm) = session
                .find_vm_by_instance_uuid(&placement.datacenter, uid)
                .await?
            {
                warn!(vm = %vm, "found an existing VM for this machine; adopting it");
                set_machine_ref(self.store.as_ref(), machine, &vm.value).await?;
                return Ok(Reconciled::Done);
            }
        }

        let template = session.template_properties(&placement.template).await?;
        let ssh_public_keys = cluster_config.ssh_public_keys();
        let cluster_name = cluster.name_any();
        let spec = build_clone_spec(&CloneInputs {
            machine_name: &name,
            machine_uid: uid.as_deref(),
            cluster_name: &cluster_name,
            settings: &settings,
            placement: &placement,
            template: &template,
            user_data: &user_data,
            ssh_public_keys: &ssh_public_keys,
        })?;

        self.publish(
            machine,
            MachineEvent::CloneSubmitted {
                template: settings.template.clone(),
            },
        )
        .await;
        let task = session.clone_vm(&placement.template, &spec).await?;
        info!(task = %task, template = %placement.template, "clone submitted");

        set_task_ref(self.store.as_ref(), machine, &task.value).await?;
        Ok(Reconciled::retry_after(
            self.config.task_poll_interval,
            format!("clone task {} submitted", task.value),
        ))
    }

    async fn publish(&self, machine: &Machine, event: MachineEvent) {
        self.events.publish(&machine.object_ref(&()), event).await;
    }
}

/// VM reference recorded for a machine: provider status first, then annotation
fn vm_ref(machine: &Machine) -> Result<Option<MoRef>> {
    let from_status = VsphereMachineProviderStatus::from_machine(machine)?
        .map(|s| s.machine_ref)
        .filter(|r| !r.is_empty());
    Ok(from_status
        .or_else(|| machine.annotation(ANNOTATION_VM_REF).map(str::to_string))
        .map(MoRef::vm))
}
