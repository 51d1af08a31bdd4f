//! Clone spec construction
//!
//! [`resolve_placement`] performs the inventory lookups a clone needs; every
//! other step is the pure [`build_clone_spec`], which turns the machine's
//! settings and the template's introspected properties into a [`CloneSpec`].
//! Nothing here submits anything to the hypervisor.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;
use uuid::Uuid;

use crate::crd::MachineSettings;
use crate::vsphere::{
    CloneSpec, Datacenter, DiskResize, MoRef, RelocateSpec, TemplateProperties, VAppPropertyEdit,
    VmConfigSpec, VsphereSession, DISK_MOVE_ALLOW_SHARING,
};
use crate::{Error, Result};

/// vApp property receiving the base64 bootstrap payload
pub const VAPP_USER_DATA: &str = "user-data";
/// vApp property receiving the operator's SSH public keys
pub const VAPP_PUBLIC_KEYS: &str = "public-keys";
/// vApp property receiving the machine name
pub const VAPP_HOSTNAME: &str = "hostname";

/// guestinfo key for cloud-init user data
pub const GUESTINFO_USERDATA: &str = "guestinfo.userdata";
/// guestinfo key for the user data encoding
pub const GUESTINFO_USERDATA_ENCODING: &str = "guestinfo.userdata.encoding";
/// guestinfo key for cloud-init metadata
pub const GUESTINFO_METADATA: &str = "guestinfo.metadata";
/// guestinfo key for the metadata encoding
pub const GUESTINFO_METADATA_ENCODING: &str = "guestinfo.metadata.encoding";

const BYTES_PER_GIB: i64 = 1024 * 1024 * 1024;

// The hypervisor rejects an empty vApp value.
const EMPTY_VAPP_VALUE: &str = " ";

/// Inventory objects a clone is placed into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Datacenter
    pub datacenter: Datacenter,
    /// Folder receiving the new VM
    pub folder: MoRef,
    /// Target datastore
    pub datastore: MoRef,
    /// Target resource pool
    pub pool: MoRef,
    /// Source template
    pub template: MoRef,
}

/// Resolve datacenter, folder, datastore, pool, and template for `settings`
///
/// Unset names select the hypervisor's default object. A template reference
/// that parses as a UUID is looked up by instance UUID first.
pub async fn resolve_placement(
    session: &dyn VsphereSession,
    settings: &MachineSettings,
    machine: &str,
) -> Result<Placement> {
    let lookup = async {
        let datacenter = session
            .find_datacenter(settings.datacenter.as_deref().unwrap_or_default())
            .await?;
        let folder = session
            .find_folder(&datacenter, settings.vm_folder.as_deref().unwrap_or_default())
            .await?;
        let datastore = session
            .find_datastore(&datacenter, settings.datastore.as_deref().unwrap_or_default())
            .await?;
        let pool = session
            .find_resource_pool(
                &datacenter,
                settings.resource_pool.as_deref().unwrap_or_default(),
            )
            .await?;

        let mut template = None;
        if Uuid::parse_str(&settings.template).is_ok() {
            template = session
                .find_vm_by_instance_uuid(&datacenter, &settings.template)
                .await?;
        }
        if template.is_none() {
            template = session.find_vm(&datacenter, &settings.template).await?;
        }
        let template = template.ok_or_else(|| {
            Error::configuration_for_field(
                machine,
                "machineSpec.template",
                format!("template '{}' not found", settings.template),
            )
        })?;

        debug!(
            datacenter = %datacenter.reference,
            datastore = %datastore,
            pool = %pool,
            template = %template,
            "resolved placement"
        );
        Ok::<_, Error>(Placement {
            datacenter,
            folder,
            datastore,
            pool,
            template,
        })
    };
    lookup.await.map_err(|e| e.for_machine(machine))
}

/// Everything a clone spec is derived from
#[derive(Clone, Copy, Debug)]
pub struct CloneInputs<'a> {
    /// Machine name, used as VM name and hostname
    pub machine_name: &'a str,
    /// Machine UID, used as the VM instance UUID
    pub machine_uid: Option<&'a str>,
    /// Owning cluster name
    pub cluster_name: &'a str,
    /// Resolved machine settings
    pub settings: &'a MachineSettings,
    /// Resolved placement
    pub placement: &'a Placement,
    /// Template properties read from the hypervisor
    pub template: &'a TemplateProperties,
    /// Base64-encoded bootstrap payload
    pub user_data: &'a str,
    /// SSH public keys, one per line
    pub ssh_public_keys: &'a str,
}

/// Build the clone request for one machine
pub fn build_clone_spec(inputs: &CloneInputs<'_>) -> Result<CloneSpec> {
    let settings = inputs.settings;
    let machine = inputs.machine_name;

    let mut config = VmConfigSpec {
        instance_uuid: inputs.machine_uid.map(str::to_string),
        num_cpus: settings.num_cpus,
        memory_mb: settings.memory_mb,
        annotation: format!(
            "Virtual Machine is part of the cluster {} managed by cluster-api",
            inputs.cluster_name
        ),
        disk_uuid_enabled: true,
        ..Default::default()
    };

    if settings.vsphere_cloud_init {
        config.extra_config = guestinfo(machine, inputs.user_data);
    } else {
        config.vapp_properties = vapp_edits(inputs)?;
    }
    config.disk_resizes = disk_resizes(inputs)?;

    Ok(CloneSpec {
        name: machine.to_string(),
        folder: inputs.placement.folder.clone(),
        location: RelocateSpec {
            datastore: inputs.placement.datastore.clone(),
            pool: inputs.placement.pool.clone(),
            disk_move_type: DISK_MOVE_ALLOW_SHARING.to_string(),
        },
        power_on: true,
        config,
    })
}

fn vapp_edits(inputs: &CloneInputs<'_>) -> Result<Vec<VAppPropertyEdit>> {
    let properties = inputs.template.vapp_properties.as_ref().ok_or_else(|| {
        Error::configuration_for(
            inputs.machine_name,
            "template lacks a vApp configuration and cannot receive vApp properties",
        )
    })?;

    Ok(properties
        .iter()
        .map(|p| {
            let value = match p.id.as_str() {
                VAPP_USER_DATA => inputs.user_data.to_string(),
                VAPP_PUBLIC_KEYS => inputs.ssh_public_keys.to_string(),
                VAPP_HOSTNAME => inputs.machine_name.to_string(),
                _ => p
                    .default_value
                    .clone()
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| EMPTY_VAPP_VALUE.to_string()),
            };
            VAppPropertyEdit {
                key: p.key,
                id: p.id.clone(),
                value,
            }
        })
        .collect())
}

fn guestinfo(machine: &str, user_data: &str) -> BTreeMap<String, String> {
    let metadata = format!("instance-id: \"{machine}\"\nlocal-hostname: \"{machine}\"\n");
    BTreeMap::from([
        (GUESTINFO_USERDATA.to_string(), user_data.to_string()),
        (GUESTINFO_USERDATA_ENCODING.to_string(), "base64".to_string()),
        (GUESTINFO_METADATA.to_string(), STANDARD.encode(metadata)),
        (GUESTINFO_METADATA_ENCODING.to_string(), "base64".to_string()),
    ])
}

fn disk_resizes(inputs: &CloneInputs<'_>) -> Result<Vec<DiskResize>> {
    let machine = inputs.machine_name;

    // Two edits of one device in a single reconfigure are rejected by vCenter.
    let mut seen = BTreeSet::new();
    if let Some(dup) = inputs
        .settings
        .disks
        .iter()
        .find(|d| !seen.insert(d.label.as_str()))
    {
        return Err(Error::configuration_for_field(
            machine,
            "machineSpec.disks",
            format!("disk '{}' is listed more than once", dup.label),
        ));
    }

    inputs
        .settings
        .disks
        .iter()
        .map(|request| {
            let disk = inputs
                .template
                .disks
                .iter()
                .find(|d| d.label == request.label)
                .ok_or_else(|| {
                    Error::configuration_for_field(
                        machine,
                        "machineSpec.disks",
                        format!("template has no disk labelled '{}'", request.label),
                    )
                })?;

            let requested = request
                .size_gib
                .checked_mul(BYTES_PER_GIB)
                .filter(|b| *b > 0)
                .ok_or_else(|| {
                    Error::configuration_for_field(
                        machine,
                        "machineSpec.disks",
                        format!(
                            "invalid size {} GiB for disk '{}'",
                            request.size_gib, request.label
                        ),
                    )
                })?;

            // Disks can only grow.
            if requested <= disk.capacity_in_bytes {
                return Err(Error::configuration_for_field(
                    machine,
                    "machineSpec.disks",
                    format!(
                        "requested {} GiB for disk '{}' but the template disk already has {} bytes ({} GiB); the size must be strictly larger",
                        request.size_gib,
                        request.label,
                        disk.capacity_in_bytes,
                        disk.capacity_in_bytes / BYTES_PER_GIB,
                    ),
                ));
            }

            Ok(DiskResize {
                disk: disk.clone(),
                capacity_in_bytes: requested,
            })
        })
        .collect()
}
