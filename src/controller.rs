//! Machine controller
//!
//! Glue between kube-runtime and the [`Provisioner`]: resolves the owning
//! Cluster, manages the Machine finalizer, and turns [`Reconciled`] outcomes
//! into requeue actions.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::Machine;
use crate::provisioner::{Provisioner, Reconciled};
use crate::status::{namespace_of, MachineStore};
use crate::{Error, MACHINE_FINALIZER};

/// Requeue delay after a retryable error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Controller context shared by every reconcile
pub struct Context {
    /// Provisioning engine
    pub provisioner: Provisioner,
    /// Kubernetes reads and writes
    pub store: Arc<dyn MachineStore>,
}

impl Context {
    /// Create a context from the engine and its store
    pub fn new(provisioner: Provisioner, store: Arc<dyn MachineStore>) -> Self {
        Self { provisioner, store }
    }
}

/// Reconcile a Machine
///
/// Deletion runs the non-blocking teardown and drops the finalizer once the
/// VM is gone. Otherwise the VM is created if it does not exist yet, and
/// updated from the hypervisor once it does.
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = namespace_of(machine.as_ref());
    let name = machine.name_any();
    let config = ctx.provisioner.config();
    let mut machine = (*machine).clone();
    let deleting = machine.metadata.deletion_timestamp.is_some();
    let has_finalizer = machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER);

    if deleting && !has_finalizer {
        return Ok(Action::await_change());
    }

    let Some(cluster_name) = machine.cluster_name().map(str::to_string) else {
        warn!("machine has no cluster label; ignoring");
        return Ok(Action::await_change());
    };

    let Some(cluster) = ctx.store.get_cluster(&namespace, &cluster_name).await? else {
        if deleting {
            warn!(cluster = %cluster_name, "cluster is gone; releasing machine without teardown");
            ctx.store
                .remove_machine_finalizer(&namespace, &name, MACHINE_FINALIZER)
                .await?;
            return Ok(Action::await_change());
        }
        debug!(cluster = %cluster_name, "cluster not found yet");
        return Ok(Action::requeue(config.not_ready_requeue));
    };

    if deleting {
        info!("deleting machine");
        return match ctx.provisioner.delete(&cluster, &mut machine).await? {
            Reconciled::Done => {
                ctx.store
                    .remove_machine_finalizer(&namespace, &name, MACHINE_FINALIZER)
                    .await?;
                info!("machine deleted");
                Ok(Action::await_change())
            }
            Reconciled::RetryAfter { delay, reason } => {
                debug!(%reason, ?delay, "teardown in progress");
                Ok(Action::requeue(delay))
            }
        };
    }

    if !has_finalizer {
        ctx.store
            .add_machine_finalizer(&namespace, &name, MACHINE_FINALIZER)
            .await?;
    }

    if ctx.provisioner.exists(&cluster, &machine).await? {
        let outcome = ctx.provisioner.update(&cluster, &mut machine).await?;
        return Ok(requeue_for(outcome, config.resync_interval));
    }

    // A finished create still needs another pass to reach update.
    let outcome = ctx.provisioner.create(&cluster, &mut machine).await?;
    Ok(requeue_for(outcome, config.task_poll_interval))
}

fn requeue_for(outcome: Reconciled, when_done: Duration) -> Action {
    match outcome {
        Reconciled::Done => Action::requeue(when_done),
        Reconciled::RetryAfter { delay, reason } => {
            debug!(%reason, ?delay, "waiting");
            Action::requeue(delay)
        }
    }
}

/// Error policy for the Machine controller
///
/// Errors that need a spec edit requeue at the resync interval; everything
/// else is retried quickly.
pub fn error_policy(machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        machine = %machine.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::requeue(ctx.provisioner.config().resync_interval)
    }
}
