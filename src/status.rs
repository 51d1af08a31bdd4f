//! Provider status and annotation persistence
//!
//! Every write is a read-modify-write over the in-memory Machine: the current
//! provider status is copied forward, only the targeted field and
//! `lastUpdated` change, and the local object is updated after the API write
//! succeeds so later steps in the same pass see the new state. Task and machine
//! reference writes are skipped when the value is unchanged.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::{
    now_rfc3339, Cluster, Machine, MachineAddress, MachineStatus, VsphereClusterProviderStatus,
    VsphereMachineProviderStatus,
};
use crate::{Error, Result, ANNOTATION_TASK_REF};

/// Address type written for the guest IP
pub const ADDRESS_INTERNAL_IP: &str = "InternalIP";

/// Trait abstracting the declarative object store
///
/// Allows mocking the Kubernetes API in tests while using the real client in
/// production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Merge `status` into a Machine's status subresource
    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;

    /// Set (`Some`) or remove (`None`) Machine annotations
    async fn patch_machine_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// Merge `status` into a Cluster's status subresource
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;

    /// Get a Cluster by name
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Get a Secret by name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Add a finalizer to a Machine if not present
    async fn add_machine_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<()>;

    /// Remove a finalizer from a Machine if present
    async fn remove_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeMachineStore {
    client: Client,
    field_manager: String,
}

impl KubeMachineStore {
    /// Create a store writing with the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let machine = api.get(name).await?;
        let mut finalizers = machine.metadata.finalizers.unwrap_or_default();
        if !edit(&mut finalizers) {
            return Ok(());
        }
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &self.params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MachineStore for KubeMachineStore {
    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &self.params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_machine_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations
            }
        });
        api.patch(name, &self.params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &self.params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        self.set_finalizers(namespace, name, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_machine_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<()> {
        self.set_finalizers(namespace, name, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }
}

/// Namespace of an object, `default` when unset
pub fn namespace_of<K: ResourceExt>(object: &K) -> String {
    object.namespace().unwrap_or_else(|| "default".to_string())
}

fn current_status(machine: &Machine) -> Result<VsphereMachineProviderStatus> {
    Ok(VsphereMachineProviderStatus::from_machine(machine)?.unwrap_or_default())
}

async fn write_provider_status(
    store: &dyn MachineStore,
    machine: &mut Machine,
    status: VsphereMachineProviderStatus,
) -> Result<()> {
    let value = status.to_value()?;
    store
        .patch_machine_status(
            &namespace_of(machine),
            &machine.name_any(),
            serde_json::json!({ "providerStatus": value }),
        )
        .await?;
    machine
        .status
        .get_or_insert_with(MachineStatus::default)
        .provider_status = Some(value);
    Ok(())
}

/// Record the in-flight task, or clear it with an empty `task_ref`
///
/// Writes the task annotation and the provider status `taskRef`. Returns
/// whether anything was written.
pub async fn set_task_ref(
    store: &dyn MachineStore,
    machine: &mut Machine,
    task_ref: &str,
) -> Result<bool> {
    let mut status = current_status(machine)?;
    let annotated = machine.annotation(ANNOTATION_TASK_REF).unwrap_or_default();
    if status.task_ref == task_ref && annotated == task_ref {
        return Ok(false);
    }

    if annotated != task_ref {
        let value = Some(task_ref.to_string()).filter(|t| !t.is_empty());
        update_annotations(
            store,
            machine,
            BTreeMap::from([(ANNOTATION_TASK_REF.to_string(), value)]),
        )
        .await?;
    }

    if status.task_ref != task_ref {
        status.task_ref = task_ref.to_string();
        status.touch();
        write_provider_status(store, machine, status).await?;
    }
    debug!(machine = %machine.name_any(), task = task_ref, "task reference updated");
    Ok(true)
}

/// Record the provisioned VM; returns whether anything was written
pub async fn set_machine_ref(
    store: &dyn MachineStore,
    machine: &mut Machine,
    vm_ref: &str,
) -> Result<bool> {
    let mut status = current_status(machine)?;
    if status.machine_ref == vm_ref {
        return Ok(false);
    }
    status.machine_ref = vm_ref.to_string();
    status.touch();
    write_provider_status(store, machine, status).await?;
    debug!(machine = %machine.name_any(), vm = vm_ref, "machine reference updated");
    Ok(true)
}

/// Set or remove annotations; always writes
pub async fn update_annotations(
    store: &dyn MachineStore,
    machine: &mut Machine,
    annotations: BTreeMap<String, Option<String>>,
) -> Result<()> {
    store
        .patch_machine_annotations(&namespace_of(machine), &machine.name_any(), annotations.clone())
        .await?;
    let local = machine.annotations_mut();
    for (key, value) in annotations {
        match value {
            Some(v) => local.insert(key, v),
            None => local.remove(&key),
        };
    }
    Ok(())
}

/// Publish the guest IP as the machine's internal address
pub async fn set_internal_ip(store: &dyn MachineStore, machine: &mut Machine, ip: &str) -> Result<()> {
    let addresses = vec![MachineAddress {
        type_: ADDRESS_INTERNAL_IP.to_string(),
        address: ip.to_string(),
    }];
    store
        .patch_machine_status(
            &namespace_of(machine),
            &machine.name_any(),
            serde_json::json!({ "addresses": addresses }),
        )
        .await?;
    machine
        .status
        .get_or_insert_with(MachineStatus::default)
        .addresses = addresses;
    Ok(())
}

/// Stamp the cluster provider status with the current time
pub async fn touch_cluster_status(store: &dyn MachineStore, cluster: &Cluster) -> Result<()> {
    let mut status = VsphereClusterProviderStatus::from_cluster(cluster)?.unwrap_or_default();
    status.last_updated = now_rfc3339();
    let value = serde_json::to_value(&status)
        .map_err(|e| Error::serialization_for_kind("VsphereClusterProviderStatus", e.to_string()))?;
    store
        .patch_cluster_status(
            &namespace_of(cluster),
            &cluster.name_any(),
            serde_json::json!({ "providerStatus": value }),
        )
        .await
}
