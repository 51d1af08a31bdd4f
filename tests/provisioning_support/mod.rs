//! In-memory stand-ins for vCenter and the Kubernetes object store

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use serde_json::{json, Value};

use vsphere_provisioner::bootstrap::{BootstrapData, BootstrapDataSource};
use vsphere_provisioner::crd::{Cluster, ClusterSpec, Machine, MachineSpec, MachineStatus};
use vsphere_provisioner::crd::{MachineVersionInfo, ProviderSpec};
use vsphere_provisioner::events::{EventPublisher, MachineEvent};
use vsphere_provisioner::session::{Credentials, Endpoint};
use vsphere_provisioner::status::MachineStore;
use vsphere_provisioner::vsphere::{
    CloneSpec, Datacenter, MoRef, PowerState, TaskInfo, TaskResult, TaskState, TemplateProperties,
    VAppProperty, VirtualDisk, VmRuntime, VsphereConnector, VsphereSession,
};
use vsphere_provisioner::{Result, CLUSTER_NAME_LABEL};

pub const NAMESPACE: &str = "capi";
pub const MACHINE_UID: &str = "4f2d1c7a-8b3e-4a6f-9d21-0c5e7b9a1f34";
pub const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Default)]
struct Hypervisor {
    next_id: u32,
    clones: Vec<CloneSpec>,
    tasks: HashMap<String, TaskInfo>,
    vms: HashMap<String, VmRuntime>,
    logins: usize,
}

/// A vCenter that runs tasks only when told to
#[derive(Clone, Default)]
pub struct FakeVcenter {
    state: Arc<Mutex<Hypervisor>>,
}

impl FakeVcenter {
    pub fn clone_requests(&self) -> Vec<CloneSpec> {
        self.state.lock().unwrap().clones.clone()
    }

    pub fn logins(&self) -> usize {
        self.state.lock().unwrap().logins
    }

    /// Complete a task; a clone creates a powered-on VM reporting `guest_ip`
    pub fn finish(&self, task: &str, guest_ip: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        let info = state.tasks.get(task).cloned().expect("unknown task");
        let result = match info.description_id.as_str() {
            "VirtualMachine.clone" => {
                state.next_id += 1;
                let vm_id = format!("vm-{}", state.next_id);
                let name = info.entity_name.clone().unwrap_or_default();
                state.vms.insert(
                    vm_id.clone(),
                    VmRuntime {
                        name,
                        power_state: PowerState::On,
                        guest_ip: guest_ip.map(str::to_string),
                    },
                );
                TaskResult::Reference(MoRef::vm(vm_id))
            }
            "VirtualMachine.powerOn" | "VirtualMachine.powerOff" => {
                let vm = info.entity_name.clone().unwrap_or_default();
                if let Some(runtime) = state.vms.get_mut(&vm) {
                    runtime.power_state = if info.description_id.ends_with("powerOn") {
                        PowerState::On
                    } else {
                        PowerState::Off
                    };
                }
                TaskResult::None
            }
            "VirtualMachine.destroy" => {
                let vm = info.entity_name.clone().unwrap_or_default();
                state.vms.remove(&vm);
                TaskResult::None
            }
            _ => TaskResult::None,
        };
        let entry = state.tasks.get_mut(task).expect("unknown task");
        entry.state = TaskState::Success;
        entry.result = result;
    }

    /// Fail a task with `message`
    pub fn fail(&self, task: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.tasks.get_mut(task).expect("unknown task");
        entry.state = TaskState::Error;
        entry.error = Some(message.to_string());
    }

    /// Stop a VM outside of any task, as an operator would
    pub fn power_off(&self, vm: &str) {
        if let Some(runtime) = self.state.lock().unwrap().vms.get_mut(vm) {
            runtime.power_state = PowerState::Off;
        }
    }

    pub fn set_guest_ip(&self, vm: &str, ip: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(runtime) = state.vms.get_mut(vm) {
            runtime.guest_ip = Some(ip.to_string());
        }
    }

    fn submit(&self, operation: &str, entity: &str) -> MoRef {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let key = format!("task-{}", state.next_id);
        state.tasks.insert(
            key.clone(),
            TaskInfo {
                key: key.clone(),
                description_id: operation.to_string(),
                entity_name: Some(entity.to_string()),
                state: TaskState::Running,
                result: TaskResult::None,
                error: None,
            },
        );
        MoRef::task(key)
    }
}

fn datacenter() -> Datacenter {
    Datacenter {
        reference: MoRef::new("Datacenter", "datacenter-2"),
        path: "/dc1".to_string(),
        vm_folder: MoRef::new("Folder", "group-v4"),
    }
}

#[async_trait]
impl VsphereSession for FakeVcenter {
    async fn is_active(&self) -> Result<bool> {
        Ok(true)
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn find_datacenter(&self, _path: &str) -> Result<Datacenter> {
        Ok(datacenter())
    }

    async fn find_folder(&self, datacenter: &Datacenter, _path: &str) -> Result<MoRef> {
        Ok(datacenter.vm_folder.clone())
    }

    async fn find_datastore(&self, _datacenter: &Datacenter, _path: &str) -> Result<MoRef> {
        Ok(MoRef::new("Datastore", "datastore-14"))
    }

    async fn find_resource_pool(&self, _datacenter: &Datacenter, _path: &str) -> Result<MoRef> {
        Ok(MoRef::new("ResourcePool", "resgroup-9"))
    }

    async fn find_vm(&self, _datacenter: &Datacenter, path: &str) -> Result<Option<MoRef>> {
        Ok((path == "ubuntu-2204-kube").then(|| MoRef::vm("vm-template")))
    }

    async fn find_vm_by_instance_uuid(
        &self,
        _datacenter: &Datacenter,
        _uuid: &str,
    ) -> Result<Option<MoRef>> {
        Ok(None)
    }

    async fn template_properties(&self, _template: &MoRef) -> Result<TemplateProperties> {
        Ok(TemplateProperties {
            disks: vec![VirtualDisk {
                key: 2000,
                label: "Hard disk 1".to_string(),
                capacity_in_bytes: 20 * GIB,
                device: json!({"_typeName": "VirtualDisk", "key": 2000}),
            }],
            vapp_properties: Some(vec![
                VAppProperty {
                    key: 0,
                    id: "user-data".to_string(),
                    default_value: None,
                },
                VAppProperty {
                    key: 1,
                    id: "public-keys".to_string(),
                    default_value: None,
                },
                VAppProperty {
                    key: 2,
                    id: "hostname".to_string(),
                    default_value: Some("ubuntuguest".to_string()),
                },
            ]),
        })
    }

    async fn vm_runtime(&self, vm: &MoRef) -> Result<Option<VmRuntime>> {
        Ok(self.state.lock().unwrap().vms.get(&vm.value).cloned())
    }

    async fn task_info(&self, task: &MoRef) -> Result<Option<TaskInfo>> {
        Ok(self.state.lock().unwrap().tasks.get(&task.value).cloned())
    }

    async fn clone_vm(&self, _template: &MoRef, spec: &CloneSpec) -> Result<MoRef> {
        self.state.lock().unwrap().clones.push(spec.clone());
        Ok(self.submit("VirtualMachine.clone", &spec.name))
    }

    async fn power_on_vm(&self, vm: &MoRef) -> Result<MoRef> {
        Ok(self.submit("VirtualMachine.powerOn", &vm.value))
    }

    async fn power_off_vm(&self, vm: &MoRef) -> Result<MoRef> {
        Ok(self.submit("VirtualMachine.powerOff", &vm.value))
    }

    async fn destroy_vm(&self, vm: &MoRef) -> Result<MoRef> {
        Ok(self.submit("VirtualMachine.destroy", &vm.value))
    }
}

#[async_trait]
impl VsphereConnector for FakeVcenter {
    async fn login(
        &self,
        _endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn VsphereSession>> {
        self.state.lock().unwrap().logins += 1;
        Ok(Arc::new(self.clone()))
    }
}

#[derive(Default)]
struct Objects {
    annotations: BTreeMap<String, String>,
    status: serde_json::Map<String, Value>,
    cluster_status: serde_json::Map<String, Value>,
    finalizers: Vec<String>,
    writes: usize,
}

/// Object store holding a single Machine's mutable fields
#[derive(Clone, Default)]
pub struct FakeStore {
    objects: Arc<Mutex<Objects>>,
}

impl FakeStore {
    pub fn annotation(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().annotations.get(key).cloned()
    }

    pub fn provider_status(&self) -> Value {
        self.objects
            .lock()
            .unwrap()
            .status
            .get("providerStatus")
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn writes(&self) -> usize {
        self.objects.lock().unwrap().writes
    }

    pub fn cluster_touched(&self) -> bool {
        self.objects
            .lock()
            .unwrap()
            .cluster_status
            .contains_key("providerStatus")
    }

    /// The Machine as a fresh watch event would deliver it
    pub fn reload(&self, mut machine: Machine) -> Machine {
        let objects = self.objects.lock().unwrap();
        machine.metadata.annotations = Some(objects.annotations.clone());
        machine.status = Some(MachineStatus {
            provider_status: objects.status.get("providerStatus").cloned(),
            addresses: objects
                .status
                .get("addresses")
                .cloned()
                .map(|a| serde_json::from_value(a).unwrap())
                .unwrap_or_default(),
        });
        machine.metadata.finalizers = Some(objects.finalizers.clone());
        machine
    }
}

#[async_trait]
impl MachineStore for FakeStore {
    async fn patch_machine_status(&self, _namespace: &str, _name: &str, status: Value) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if let Value::Object(fields) = status {
            objects.status.extend(fields);
        }
        objects.writes += 1;
        Ok(())
    }

    async fn patch_machine_annotations(
        &self,
        _namespace: &str,
        _name: &str,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        for (key, value) in annotations {
            match value {
                Some(v) => objects.annotations.insert(key, v),
                None => objects.annotations.remove(&key),
            };
        }
        objects.writes += 1;
        Ok(())
    }

    async fn patch_cluster_status(&self, _namespace: &str, _name: &str, status: Value) -> Result<()> {
        if let Value::Object(fields) = status {
            self.objects.lock().unwrap().cluster_status.extend(fields);
        }
        Ok(())
    }

    async fn get_cluster(&self, _namespace: &str, _name: &str) -> Result<Option<Cluster>> {
        Ok(Some(sample_cluster()))
    }

    async fn get_secret(&self, _namespace: &str, _name: &str) -> Result<Option<Secret>> {
        Ok(None)
    }

    async fn add_machine_finalizer(&self, _namespace: &str, _name: &str, finalizer: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        if !objects.finalizers.iter().any(|f| f == finalizer) {
            objects.finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_machine_finalizer(
        &self,
        _namespace: &str,
        _name: &str,
        finalizer: &str,
    ) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .finalizers
            .retain(|f| f != finalizer);
        Ok(())
    }
}

/// Keeps every published event in order
#[derive(Clone, Default)]
pub struct RecordedEvents {
    events: Arc<Mutex<Vec<MachineEvent>>>,
}

impl RecordedEvents {
    pub fn reasons(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(MachineEvent::reason)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordedEvents {
    async fn publish(&self, _machine: &ObjectReference, event: MachineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Bootstrap source that always has a payload
pub struct StaticBootstrap;

#[async_trait]
impl BootstrapDataSource for StaticBootstrap {
    async fn user_data(&self, _cluster: &Cluster, _machine: &Machine) -> Result<BootstrapData> {
        Ok(BootstrapData::Ready("I2Nsb3VkLWNvbmZpZw==".to_string()))
    }
}

pub fn sample_cluster() -> Cluster {
    let mut cluster = Cluster::new(
        "prod",
        ClusterSpec {
            provider_spec: ProviderSpec {
                value: Some(json!({
                    "vsphereServer": "vcenter.lab.example.com",
                    "vsphereUser": "administrator@vsphere.local",
                    "vspherePassword": "s3cret",
                    "sshAuthorizedKeys": ["ssh-ed25519 AAAAC3Nza ops@lab"],
                })),
            },
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster
}

pub fn sample_machine() -> Machine {
    let mut machine = Machine::new(
        "prod-worker-0",
        MachineSpec {
            provider_spec: ProviderSpec {
                value: Some(json!({
                    "machineSpec": {
                        "datacenter": "dc1",
                        "template": "ubuntu-2204-kube",
                        "numCPUs": 4,
                        "memoryMB": 8192,
                        "disks": [{"diskLabel": "Hard disk 1", "diskSizeGB": 25}],
                    }
                })),
            },
            versions: MachineVersionInfo {
                kubelet: "1.31.2".to_string(),
                control_plane: None,
            },
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine.metadata.uid = Some(MACHINE_UID.to_string());
    machine.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        "prod".to_string(),
    )]));
    machine
}
