//! vSphere provider configuration embedded in Machine and Cluster specs
//!
//! Machine placement can be given either through the typed `machineSpec` or the
//! older string map `machineVariables`. [`MachineSettings::resolve`] merges both,
//! preferring typed values, and parses the string-encoded numerics.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::SecretRef;
use crate::{Error, Result};

/// `machineVariables` key for the datacenter name or path
pub const VAR_DATACENTER: &str = "datacenter";
/// `machineVariables` key for the datastore name or path
pub const VAR_DATASTORE: &str = "datastore";
/// `machineVariables` key for the resource pool name or path
pub const VAR_RESOURCE_POOL: &str = "resource_pool";
/// `machineVariables` key for the VM folder path
pub const VAR_VM_FOLDER: &str = "vm_folder";
/// `machineVariables` key for the source template
pub const VAR_TEMPLATE: &str = "vm_template";
/// `machineVariables` key for the vCPU override
pub const VAR_NUM_CPUS: &str = "num_cpus";
/// `machineVariables` key for the memory override in MiB
pub const VAR_MEMORY: &str = "memory";
/// `machineVariables` key for the label of the disk to resize
pub const VAR_DISK_LABEL: &str = "disk_label";
/// `machineVariables` key for the desired disk size in GiB
pub const VAR_DISK_SIZE: &str = "disk_size";

/// Provider config carried in `Machine.spec.providerSpec.value`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VsphereMachineProviderConfig {
    /// Free-form string variables (legacy placement format)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_variables: BTreeMap<String, String>,

    /// Typed placement and sizing
    #[serde(default)]
    pub machine_spec: VsphereMachineSpec,
}

/// Typed placement and sizing for a vSphere VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VsphereMachineSpec {
    /// Datacenter name or inventory path; the only datacenter when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    /// Datastore name or inventory path; the only datastore when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    /// Resource pool name or inventory path; the only compute resource's pool when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,

    /// VM folder path; the datacenter's VM folder when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_folder: Option<String>,

    /// Source template name, inventory path, or instance UUID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// vCPU count override
    #[serde(default, rename = "numCPUs", skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,

    /// Memory override in MiB
    #[serde(default, rename = "memoryMB", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,

    /// Template disks to grow
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSpec>,

    /// Deliver bootstrap data through guestinfo instead of vApp properties
    #[serde(default)]
    pub vsphere_cloud_init: bool,
}

/// A template disk to resize
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Device label on the template (e.g., "Hard disk 1")
    pub disk_label: String,

    /// Desired size in GiB; must exceed the template's current size
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: i64,
}

/// Provider config carried in `Cluster.spec.providerSpec.value`
#[derive(Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VsphereClusterProviderConfig {
    /// vCenter address: hostname, IP, or URL
    pub vsphere_server: String,

    /// Inline user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_user: Option<String>,

    /// Inline password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_password: Option<String>,

    /// Secret with `username` and `password` keys, used when no inline credentials are set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_credential_secret: Option<SecretRef>,

    /// Skip TLS verification of the vCenter certificate
    #[serde(default)]
    pub insecure: bool,

    /// PEM bundle to trust for the vCenter certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_pem: Option<String>,

    /// SSH public keys authorized on provisioned machines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

impl std::fmt::Debug for VsphereClusterProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereClusterProviderConfig")
            .field("vsphere_server", &self.vsphere_server)
            .field("vsphere_user", &self.vsphere_user)
            .field(
                "vsphere_password",
                &self.vsphere_password.as_ref().map(|_| "<redacted>"),
            )
            .field("vsphere_credential_secret", &self.vsphere_credential_secret)
            .field("insecure", &self.insecure)
            .field("ca_cert_pem", &self.ca_cert_pem.is_some())
            .field("ssh_authorized_keys", &self.ssh_authorized_keys.len())
            .finish()
    }
}

impl VsphereClusterProviderConfig {
    /// Public keys joined one per line, as the `public-keys` vApp property expects
    pub fn ssh_public_keys(&self) -> String {
        self.ssh_authorized_keys.join("\n")
    }
}

/// A disk resize request after validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskRequest {
    /// Device label on the template
    pub label: String,
    /// Desired size in GiB
    pub size_gib: i64,
}

/// Machine placement and sizing with typed and legacy sources merged
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MachineSettings {
    /// Datacenter name or path, `None` for the default
    pub datacenter: Option<String>,
    /// Datastore name or path, `None` for the default
    pub datastore: Option<String>,
    /// Resource pool name or path, `None` for the default
    pub resource_pool: Option<String>,
    /// VM folder path, `None` for the datacenter's VM folder
    pub vm_folder: Option<String>,
    /// Source template reference
    pub template: String,
    /// vCPU override
    pub num_cpus: Option<i32>,
    /// Memory override in MiB
    pub memory_mb: Option<i64>,
    /// Disks to grow
    pub disks: Vec<DiskRequest>,
    /// Use guestinfo extra-config for bootstrap data
    pub vsphere_cloud_init: bool,
}

impl MachineSettings {
    /// Merge and validate the provider config of `machine`
    pub fn resolve(config: &VsphereMachineProviderConfig, machine: &str) -> Result<Self> {
        let spec = &config.machine_spec;
        let vars = &config.machine_variables;

        let pick = |typed: &Option<String>, key: &str| -> Option<String> {
            typed
                .as_ref()
                .filter(|v| !v.is_empty())
                .or_else(|| vars.get(key).filter(|v| !v.is_empty()))
                .cloned()
        };

        let template = pick(&spec.template, VAR_TEMPLATE).ok_or_else(|| {
            Error::configuration_for_field(
                machine,
                "machineSpec.template",
                "no source template configured",
            )
        })?;

        let num_cpus = match spec.num_cpus {
            Some(n) => Some(n),
            None => parse_var::<i32>(vars, VAR_NUM_CPUS, machine)?,
        };
        if let Some(n) = num_cpus.filter(|n| *n <= 0) {
            return Err(Error::configuration_for_field(
                machine,
                "machineSpec.numCPUs",
                format!("vCPU count must be positive, got {n}"),
            ));
        }

        let memory_mb = match spec.memory_mb {
            Some(n) => Some(n),
            None => parse_var::<i64>(vars, VAR_MEMORY, machine)?,
        };
        if let Some(n) = memory_mb.filter(|n| *n <= 0) {
            return Err(Error::configuration_for_field(
                machine,
                "machineSpec.memoryMB",
                format!("memory must be positive, got {n} MiB"),
            ));
        }

        Ok(Self {
            datacenter: pick(&spec.datacenter, VAR_DATACENTER),
            datastore: pick(&spec.datastore, VAR_DATASTORE),
            resource_pool: pick(&spec.resource_pool, VAR_RESOURCE_POOL),
            vm_folder: pick(&spec.vm_folder, VAR_VM_FOLDER),
            template,
            num_cpus,
            memory_mb,
            disks: resolve_disks(config, machine)?,
            vsphere_cloud_init: spec.vsphere_cloud_init,
        })
    }
}

fn resolve_disks(config: &VsphereMachineProviderConfig, machine: &str) -> Result<Vec<DiskRequest>> {
    if !config.machine_spec.disks.is_empty() {
        return config
            .machine_spec
            .disks
            .iter()
            .map(|d| {
                if d.disk_label.is_empty() {
                    return Err(Error::configuration_for_field(
                        machine,
                        "machineSpec.disks",
                        "disk entry has an empty diskLabel",
                    ));
                }
                Ok(DiskRequest {
                    label: d.disk_label.clone(),
                    size_gib: d.disk_size_gb,
                })
            })
            .collect();
    }

    let vars = &config.machine_variables;
    let Some(label) = vars.get(VAR_DISK_LABEL).filter(|l| !l.is_empty()) else {
        return Ok(Vec::new());
    };
    let size_gib = parse_var::<i64>(vars, VAR_DISK_SIZE, machine)?.ok_or_else(|| {
        Error::configuration_for_field(
            machine,
            VAR_DISK_SIZE,
            format!("disk_label '{label}' is set but disk_size is missing"),
        )
    })?;
    Ok(vec![DiskRequest {
        label: label.clone(),
        size_gib,
    }])
}

fn parse_var<T: std::str::FromStr>(
    vars: &BTreeMap<String, String>,
    key: &str,
    machine: &str,
) -> Result<Option<T>> {
    match vars.get(key).map(|v| v.trim()) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            Error::configuration_for_field(
                machine,
                format!("machineVariables.{key}"),
                format!("{key} value '{raw}' is not an integer"),
            )
        }),
    }
}
