//! vSphere JSON API client
//!
//! Speaks the VI/JSON protocol (`/sdk/vim25/{release}/{type}/{id}/{method}`)
//! with reqwest. The session id returned by `Login` is sent on every later
//! request in the `vmware-api-session-id` header. Every request is bounded by
//! the client timeout; dropping a request future cancels it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    CloneSpec, Datacenter, MoRef, PowerState, TaskInfo, TaskResult, TaskState,
    TemplateProperties, VAppProperty, VirtualDisk, VmRuntime, VsphereConnector, VsphereSession,
    KIND_DATACENTER, KIND_DATASTORE, KIND_FOLDER, KIND_RESOURCE_POOL,
};
use crate::session::{Credentials, Endpoint};
use crate::{Error, Result};

/// API release used in request paths
pub const DEFAULT_API_RELEASE: &str = "8.0.1.0";

/// Header carrying the session id
pub const SESSION_HEADER: &str = "vmware-api-session-id";

const KIND_COMPUTE_RESOURCE: &str = "ComputeResource";
const KIND_CLUSTER_COMPUTE_RESOURCE: &str = "ClusterComputeResource";
const FAULT_NOT_FOUND: &str = "ManagedObjectNotFound";
const FAULT_NOT_AUTHENTICATED: &str = "NotAuthenticated";

/// Opens [`RestSession`]s
#[derive(Clone, Debug)]
pub struct RestConnector {
    api_timeout: Duration,
}

impl RestConnector {
    /// Create a connector whose requests time out after `api_timeout`
    pub fn new(api_timeout: Duration) -> Self {
        Self { api_timeout }
    }

    fn http_client(&self, endpoint: &Endpoint) -> Result<Client> {
        let mut builder = Client::builder().timeout(self.api_timeout);
        if endpoint.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &endpoint.ca_cert_pem {
            let cert = Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                Error::invalid_endpoint(&endpoint.server, format!("invalid CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| Error::internal_with_context("http-client", e.to_string()))
    }
}

#[async_trait]
impl VsphereConnector for RestConnector {
    async fn login(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn VsphereSession>> {
        let client = self.http_client(endpoint)?;
        let base = format!(
            "{}/vim25/{}",
            endpoint.url.as_str().trim_end_matches('/'),
            DEFAULT_API_RELEASE
        );

        let response = client
            .post(format!("{base}/SessionManager/SessionManager/Login"))
            .json(&json!({
                "userName": credentials.username,
                "password": credentials.password(),
            }))
            .send()
            .await
            .map_err(|e| transport_error("Login", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            return Err(Error::authentication(
                endpoint.host(),
                fault_message(status, &body),
            ));
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::protocol(format!("Login response carried no {SESSION_HEADER} header"))
            })?;

        Ok(Arc::new(RestSession {
            client,
            base,
            session_id,
            server: endpoint.host().to_string(),
        }))
    }
}

/// A logged-in VI/JSON session
pub struct RestSession {
    client: Client,
    base: String,
    session_id: String,
    server: String,
}

#[derive(Deserialize)]
struct WireMoRef {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

impl From<WireMoRef> for MoRef {
    fn from(r: WireMoRef) -> Self {
        MoRef::new(r.kind, r.value)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    root_folder: WireMoRef,
}

impl RestSession {
    /// Send a request; `Ok(None)` means the target object does not exist
    async fn call(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        debug!(operation, path, "vSphere request");
        let mut request = self
            .client
            .request(method, format!("{}/{}", self.base, path))
            .header(SESSION_HEADER, &self.session_id);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                Error::protocol(format!("{operation} returned invalid JSON: {e}"))
            })?
        };

        interpret_response(operation, &self.server, status, value)
    }

    async fn property(&self, object: &MoRef, name: &str) -> Result<Option<Value>> {
        self.call(
            name,
            Method::GET,
            &format!("{}/{}/{}", object.kind, object.value, name),
            None,
        )
        .await
    }

    async fn required_property<T: serde::de::DeserializeOwned>(
        &self,
        object: &MoRef,
        name: &str,
    ) -> Result<T> {
        let value = self
            .property(object, name)
            .await?
            .ok_or_else(|| Error::hypervisor(name, format!("{object} no longer exists")))?;
        serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("cannot decode {object}.{name}: {e}")))
    }

    async fn invoke_task(&self, operation: &str, object: &MoRef, body: Value) -> Result<MoRef> {
        let value = self
            .call(
                operation,
                Method::POST,
                &format!("{}/{}/{}", object.kind, object.value, operation),
                Some(body),
            )
            .await?
            .ok_or_else(|| Error::hypervisor(operation, format!("{object} no longer exists")))?;
        let task: WireMoRef = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("{operation} did not return a task: {e}")))?;
        Ok(task.into())
    }

    async fn find_by_path(&self, path: &str) -> Result<Option<MoRef>> {
        let found = self
            .call(
                "FindByInventoryPath",
                Method::POST,
                "SearchIndex/SearchIndex/FindByInventoryPath",
                Some(json!({ "inventoryPath": path })),
            )
            .await?;
        decode_optional_moref(found)
    }

    async fn children(&self, folder: &MoRef) -> Result<Vec<MoRef>> {
        let children: Vec<WireMoRef> = self.required_property(folder, "childEntity").await?;
        Ok(children.into_iter().map(MoRef::from).collect())
    }

    async fn compute_resource_pool(&self, compute: &MoRef) -> Result<MoRef> {
        let pool: WireMoRef = self.required_property(compute, "resourcePool").await?;
        Ok(pool.into())
    }
}

#[async_trait]
impl VsphereSession for RestSession {
    async fn is_active(&self) -> Result<bool> {
        match self
            .call(
                "currentSession",
                Method::GET,
                "SessionManager/SessionManager/currentSession",
                None,
            )
            .await
        {
            Ok(Some(session)) => Ok(!session.is_null()),
            Ok(None) | Err(Error::SessionExpired { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn logout(&self) -> Result<()> {
        self.call(
            "Logout",
            Method::POST,
            "SessionManager/SessionManager/Logout",
            None,
        )
        .await?;
        Ok(())
    }

    async fn find_datacenter(&self, path: &str) -> Result<Datacenter> {
        let reference = if path.is_empty() {
            let content: ServiceContent = serde_json::from_value(
                self.call(
                    "RetrieveServiceContent",
                    Method::GET,
                    "ServiceInstance/ServiceInstance/content",
                    None,
                )
                .await?
                .unwrap_or_default(),
            )
            .map_err(|e| Error::protocol(format!("cannot decode service content: {e}")))?;
            let root = MoRef::from(content.root_folder);
            single_default(self.children(&root).await?, &[KIND_DATACENTER], "datacenter")?
        } else {
            let absolute = format!("/{}", path.trim_start_matches('/'));
            self.find_by_path(&absolute)
                .await?
                .filter(|r| r.kind == KIND_DATACENTER)
                .ok_or_else(|| Error::configuration(format!("datacenter '{path}' not found")))?
        };

        let name: String = self.required_property(&reference, "name").await?;
        let vm_folder: WireMoRef = self.required_property(&reference, "vmFolder").await?;
        let path = if path.is_empty() {
            name
        } else {
            path.trim_matches('/').to_string()
        };
        Ok(Datacenter {
            reference,
            path,
            vm_folder: vm_folder.into(),
        })
    }

    async fn find_folder(&self, datacenter: &Datacenter, path: &str) -> Result<MoRef> {
        if path.is_empty() {
            return Ok(datacenter.vm_folder.clone());
        }
        self.find_by_path(&inventory_path(datacenter, "vm", path))
            .await?
            .filter(|r| r.kind == KIND_FOLDER)
            .ok_or_else(|| Error::configuration(format!("folder '{path}' not found")))
    }

    async fn find_datastore(&self, datacenter: &Datacenter, path: &str) -> Result<MoRef> {
        if path.is_empty() {
            let datastores: Vec<WireMoRef> = self
                .required_property(&datacenter.reference, "datastore")
                .await?;
            return single_default(
                datastores.into_iter().map(MoRef::from).collect(),
                &[KIND_DATASTORE],
                "datastore",
            );
        }
        self.find_by_path(&inventory_path(datacenter, "datastore", path))
            .await?
            .filter(|r| r.kind == KIND_DATASTORE)
            .ok_or_else(|| Error::configuration(format!("datastore '{path}' not found")))
    }

    async fn find_resource_pool(&self, datacenter: &Datacenter, path: &str) -> Result<MoRef> {
        const COMPUTE: &[&str] = &[KIND_COMPUTE_RESOURCE, KIND_CLUSTER_COMPUTE_RESOURCE];

        let found = if path.is_empty() {
            let host_folder: WireMoRef = self
                .required_property(&datacenter.reference, "hostFolder")
                .await?;
            let computes = self.children(&host_folder.into()).await?;
            single_default(computes, COMPUTE, "compute resource")?
        } else {
            self.find_by_path(&inventory_path(datacenter, "host", path))
                .await?
                .ok_or_else(|| Error::configuration(format!("resource pool '{path}' not found")))?
        };

        match found.kind.as_str() {
            KIND_RESOURCE_POOL => Ok(found),
            k if COMPUTE.contains(&k) => self.compute_resource_pool(&found).await,
            other => Err(Error::configuration(format!(
                "'{path}' is a {other}, not a resource pool"
            ))),
        }
    }

    async fn find_vm(&self, datacenter: &Datacenter, path: &str) -> Result<Option<MoRef>> {
        Ok(self
            .find_by_path(&inventory_path(datacenter, "vm", path))
            .await?
            .filter(MoRef::is_vm))
    }

    async fn find_vm_by_instance_uuid(
        &self,
        datacenter: &Datacenter,
        uuid: &str,
    ) -> Result<Option<MoRef>> {
        let found = self
            .call(
                "FindByUuid",
                Method::POST,
                "SearchIndex/SearchIndex/FindByUuid",
                Some(json!({
                    "datacenter": wire_moref(&datacenter.reference),
                    "uuid": uuid,
                    "vmSearch": true,
                    "instanceUuid": true,
                })),
            )
            .await?;
        Ok(decode_optional_moref(found)?.filter(MoRef::is_vm))
    }

    async fn template_properties(&self, template: &MoRef) -> Result<TemplateProperties> {
        let config = self
            .property(template, "config")
            .await?
            .ok_or_else(|| Error::hypervisor("config", format!("{template} no longer exists")))?;
        parse_template_properties(&config)
    }

    async fn vm_runtime(&self, vm: &MoRef) -> Result<Option<VmRuntime>> {
        let Some(runtime) = self.property(vm, "runtime").await? else {
            return Ok(None);
        };
        let Some(name) = self.property(vm, "name").await? else {
            return Ok(None);
        };
        let guest = self.property(vm, "guest").await?.unwrap_or_default();
        Ok(Some(VmRuntime {
            name: name.as_str().unwrap_or_default().to_string(),
            power_state: parse_power_state(&runtime)?,
            guest_ip: guest
                .get("ipAddress")
                .and_then(Value::as_str)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string),
        }))
    }

    async fn task_info(&self, task: &MoRef) -> Result<Option<TaskInfo>> {
        match self.property(task, "info").await? {
            None => Ok(None),
            Some(info) => parse_task_info(&info).map(Some),
        }
    }

    async fn clone_vm(&self, template: &MoRef, spec: &CloneSpec) -> Result<MoRef> {
        self.invoke_task("CloneVM_Task", template, clone_request_body(spec))
            .await
    }

    async fn power_on_vm(&self, vm: &MoRef) -> Result<MoRef> {
        self.invoke_task("PowerOnVM_Task", vm, json!({})).await
    }

    async fn power_off_vm(&self, vm: &MoRef) -> Result<MoRef> {
        self.invoke_task("PowerOffVM_Task", vm, json!({})).await
    }

    async fn destroy_vm(&self, vm: &MoRef) -> Result<MoRef> {
        self.invoke_task("Destroy_Task", vm, json!({})).await
    }
}

// =============================================================================
// Wire helpers
// =============================================================================

fn transport_error(operation: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::hypervisor(operation, "request timed out")
    } else {
        Error::hypervisor(operation, e.to_string())
    }
}

/// Map a response to its body, `None` for a missing object, or an error
///
/// An unauthenticated answer means the session died after it was handed out;
/// that is retryable, and the next liveness check replaces the session.
fn interpret_response(
    operation: &str,
    server: &str,
    status: StatusCode,
    body: Value,
) -> Result<Option<Value>> {
    if status.is_success() {
        return Ok(Some(body));
    }
    match (status, fault_type(&body)) {
        (StatusCode::NOT_FOUND, _) | (_, Some(FAULT_NOT_FOUND)) => Ok(None),
        (StatusCode::UNAUTHORIZED, _) | (_, Some(FAULT_NOT_AUTHENTICATED)) => Err(
            Error::session_expired(server, fault_message(status, &body)),
        ),
        _ => Err(Error::hypervisor(operation, fault_message(status, &body))),
    }
}

fn fault_type(body: &Value) -> Option<&str> {
    body.get("_typeName").and_then(Value::as_str)
}

fn fault_message(status: StatusCode, body: &Value) -> String {
    let detail = ["localizedMessage", "message", "msg"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .or_else(|| {
            body.get("faultMessage")
                .and_then(|m| m.get(0))
                .and_then(|m| m.get("message"))
                .and_then(Value::as_str)
        });
    match (fault_type(body), detail) {
        (Some(fault), Some(detail)) => format!("{fault}: {detail}"),
        (Some(fault), None) => format!("{fault} (HTTP {status})"),
        (None, Some(detail)) => format!("HTTP {status}: {detail}"),
        (None, None) => format!("HTTP {status}"),
    }
}

fn wire_moref(r: &MoRef) -> Value {
    json!({"_typeName": "ManagedObjectReference", "type": r.kind, "value": r.value})
}

fn decode_optional_moref(value: Option<Value>) -> Result<Option<MoRef>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value::<WireMoRef>(v)
            .map(|r| Some(r.into()))
            .map_err(|e| Error::protocol(format!("expected an object reference: {e}"))),
    }
}

/// The only candidate of the given kinds, for lookups with nothing configured
fn single_default(candidates: Vec<MoRef>, kinds: &[&str], what: &str) -> Result<MoRef> {
    let mut matching = candidates
        .into_iter()
        .filter(|r| kinds.contains(&r.kind.as_str()));
    match (matching.next(), matching.next()) {
        (Some(only), None) => Ok(only),
        (None, _) => Err(Error::configuration(format!(
            "no {what} configured and none found"
        ))),
        (Some(_), Some(_)) => Err(Error::configuration(format!(
            "no {what} configured and more than one exists"
        ))),
    }
}

/// Absolute paths are used as-is; relative ones live under the datacenter's `root` folder
fn inventory_path(datacenter: &Datacenter, root: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}/{}/{}", datacenter.path, root, path)
    }
}

fn parse_task_info(info: &Value) -> Result<TaskInfo> {
    let str_field = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);

    let state = str_field("state")
        .ok_or_else(|| Error::protocol("task info has no state"))?;
    let result = match info.get("result") {
        None | Some(Value::Null) => TaskResult::None,
        Some(r) if fault_type(r) == Some("ManagedObjectReference") => {
            let r: WireMoRef = serde_json::from_value(r.clone())
                .map_err(|e| Error::protocol(format!("malformed task result: {e}")))?;
            TaskResult::Reference(r.into())
        }
        Some(r) => TaskResult::Other(fault_type(r).unwrap_or("unknown").to_string()),
    };
    let error = info.get("error").filter(|e| !e.is_null()).map(|e| {
        e.get("localizedMessage")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fault_message(StatusCode::OK, e.get("fault").unwrap_or(e)))
    });

    Ok(TaskInfo {
        key: str_field("key").unwrap_or_default(),
        description_id: str_field("descriptionId").unwrap_or_default(),
        entity_name: str_field("entityName"),
        state: TaskState::parse(&state),
        result,
        error,
    })
}

fn parse_power_state(runtime: &Value) -> Result<PowerState> {
    match runtime.get("powerState").and_then(Value::as_str) {
        Some("poweredOn") => Ok(PowerState::On),
        Some("poweredOff") => Ok(PowerState::Off),
        Some("suspended") => Ok(PowerState::Suspended),
        other => Err(Error::protocol(format!("unknown power state {other:?}"))),
    }
}

fn parse_template_properties(config: &Value) -> Result<TemplateProperties> {
    let devices = config
        .pointer("/hardware/device")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let disks = devices
        .iter()
        .filter(|d| fault_type(d) == Some("VirtualDisk"))
        .map(|d| {
            let key = d.get("key").and_then(Value::as_i64).unwrap_or_default();
            let capacity = d
                .get("capacityInBytes")
                .and_then(Value::as_i64)
                .or_else(|| {
                    d.get("capacityInKB")
                        .and_then(Value::as_i64)
                        .map(|kb| kb.saturating_mul(1024))
                })
                .unwrap_or_default();
            Ok(VirtualDisk {
                key: i32::try_from(key)
                    .map_err(|_| Error::protocol(format!("device key {key} out of range")))?,
                label: d
                    .pointer("/deviceInfo/label")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                capacity_in_bytes: capacity,
                device: d.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let vapp_properties = match config.get("vAppConfig") {
        None | Some(Value::Null) => None,
        Some(vapp) => Some(
            vapp.get("property")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(|p| VAppProperty {
                    key: p
                        .get("key")
                        .and_then(Value::as_i64)
                        .and_then(|k| i32::try_from(k).ok())
                        .unwrap_or_default(),
                    id: p
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    default_value: p
                        .get("defaultValue")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect(),
        ),
    };

    Ok(TemplateProperties {
        disks,
        vapp_properties,
    })
}

fn clone_request_body(spec: &CloneSpec) -> Value {
    let config = &spec.config;
    let mut config_spec = json!({
        "_typeName": "VirtualMachineConfigSpec",
        "annotation": config.annotation,
        "flags": {"_typeName": "VirtualMachineFlagInfo", "diskUuidEnabled": config.disk_uuid_enabled},
    });
    if let Some(uuid) = &config.instance_uuid {
        config_spec["instanceUuid"] = json!(uuid);
    }
    if let Some(cpus) = config.num_cpus {
        config_spec["numCPUs"] = json!(cpus);
    }
    if let Some(memory) = config.memory_mb {
        config_spec["memoryMB"] = json!(memory);
    }
    if !config.vapp_properties.is_empty() {
        let properties: Vec<Value> = config
            .vapp_properties
            .iter()
            .map(|p| {
                json!({
                    "_typeName": "VAppPropertySpec",
                    "operation": "edit",
                    "info": {"_typeName": "VAppPropertyInfo", "key": p.key, "id": p.id, "value": p.value},
                })
            })
            .collect();
        config_spec["vAppConfig"] = json!({"_typeName": "VmConfigSpec", "property": properties});
    }
    if !config.extra_config.is_empty() {
        let options: Vec<Value> = config
            .extra_config
            .iter()
            .map(|(k, v)| {
                json!({
                    "_typeName": "OptionValue",
                    "key": k,
                    "value": {"_typeName": "string", "_value": v},
                })
            })
            .collect();
        config_spec["extraConfig"] = Value::Array(options);
    }
    if !config.disk_resizes.is_empty() {
        let changes: Vec<Value> = config
            .disk_resizes
            .iter()
            .map(|resize| {
                let mut device = resize.disk.device.clone();
                device["capacityInBytes"] = json!(resize.capacity_in_bytes);
                device["capacityInKB"] = json!(resize.capacity_in_bytes / 1024);
                json!({"_typeName": "VirtualDeviceConfigSpec", "operation": "edit", "device": device})
            })
            .collect();
        config_spec["deviceChange"] = Value::Array(changes);
    }

    json!({
        "name": spec.name,
        "folder": wire_moref(&spec.folder),
        "spec": {
            "_typeName": "VirtualMachineCloneSpec",
            "location": {
                "_typeName": "VirtualMachineRelocateSpec",
                "datastore": wire_moref(&spec.location.datastore),
                "pool": wire_moref(&spec.location.pool),
                "diskMoveType": spec.location.disk_move_type,
            },
            "template": false,
            "powerOn": spec.power_on,
            "config": config_spec,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsphere::{
        DiskResize, RelocateSpec, VAppPropertyEdit, VmConfigSpec, DISK_MOVE_ALLOW_SHARING,
    };

    fn datacenter() -> Datacenter {
        Datacenter {
            reference: MoRef::new(KIND_DATACENTER, "datacenter-3"),
            path: "dc1".to_string(),
            vm_folder: MoRef::new(KIND_FOLDER, "group-v4"),
        }
    }

    #[test]
    fn unauthenticated_call_is_a_retryable_session_expiry() {
        let fault = json!({"_typeName": "NotAuthenticated", "localizedMessage": "session timed out"});
        let err = interpret_response("CloneVM_Task", "vc.example.com", StatusCode::INTERNAL_SERVER_ERROR, fault)
            .unwrap_err();
        assert!(matches!(err, Error::SessionExpired { .. }));
        assert!(err.is_retryable());

        let err = interpret_response("info", "vc.example.com", StatusCode::UNAUTHORIZED, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::SessionExpired { .. }));
    }

    #[test]
    fn missing_object_and_other_faults() {
        let missing = json!({"_typeName": "ManagedObjectNotFound"});
        assert_eq!(
            interpret_response("info", "vc", StatusCode::INTERNAL_SERVER_ERROR, missing).unwrap(),
            None
        );
        let busy = json!({"_typeName": "TaskInProgress", "localizedMessage": "busy"});
        let err = interpret_response("PowerOnVM_Task", "vc", StatusCode::INTERNAL_SERVER_ERROR, busy)
            .unwrap_err();
        assert_eq!(err.to_string(), "vSphere PowerOnVM_Task failed: TaskInProgress: busy");
    }

    #[test]
    fn relative_paths_resolve_under_the_datacenter() {
        let dc = datacenter();
        assert_eq!(inventory_path(&dc, "vm", "templates/ubuntu"), "/dc1/vm/templates/ubuntu");
        assert_eq!(inventory_path(&dc, "datastore", "ssd-01"), "/dc1/datastore/ssd-01");
        assert_eq!(inventory_path(&dc, "host", "/dc2/host/c1"), "/dc2/host/c1");
    }

    #[test]
    fn default_requires_exactly_one_candidate() {
        let one = vec![
            MoRef::new(KIND_FOLDER, "group-1"),
            MoRef::new(KIND_DATACENTER, "datacenter-3"),
        ];
        assert_eq!(
            single_default(one, &[KIND_DATACENTER], "datacenter").unwrap().value,
            "datacenter-3"
        );

        let none = vec![MoRef::new(KIND_FOLDER, "group-1")];
        assert!(matches!(
            single_default(none, &[KIND_DATACENTER], "datacenter"),
            Err(Error::Configuration { .. })
        ));

        let two = vec![
            MoRef::new(KIND_DATACENTER, "datacenter-3"),
            MoRef::new(KIND_DATACENTER, "datacenter-9"),
        ];
        let err = single_default(two, &[KIND_DATACENTER], "datacenter").unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn task_info_with_vm_result() {
        let info = json!({
            "_typeName": "TaskInfo",
            "key": "task-7",
            "descriptionId": "VirtualMachine.clone",
            "entityName": "ubuntu-template",
            "state": "success",
            "result": {"_typeName": "ManagedObjectReference", "type": "VirtualMachine", "value": "vm-42"}
        });
        let parsed = parse_task_info(&info).unwrap();
        assert_eq!(parsed.state, TaskState::Success);
        assert_eq!(parsed.description_id, "VirtualMachine.clone");
        assert_eq!(parsed.result, TaskResult::Reference(MoRef::vm("vm-42")));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn task_info_error_message_is_extracted() {
        let info = json!({
            "key": "task-8",
            "descriptionId": "VirtualMachine.clone",
            "state": "error",
            "error": {"_typeName": "LocalizedMethodFault", "localizedMessage": "Insufficient disk space"}
        });
        let parsed = parse_task_info(&info).unwrap();
        assert_eq!(parsed.state, TaskState::Error);
        assert_eq!(parsed.error.as_deref(), Some("Insufficient disk space"));
    }

    #[test]
    fn task_info_without_state_is_a_protocol_error() {
        assert!(matches!(
            parse_task_info(&json!({"key": "task-1"})),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn power_states() {
        assert_eq!(
            parse_power_state(&json!({"powerState": "poweredOn"})).unwrap(),
            PowerState::On
        );
        assert_eq!(
            parse_power_state(&json!({"powerState": "poweredOff"})).unwrap(),
            PowerState::Off
        );
        assert!(parse_power_state(&json!({})).is_err());
    }

    #[test]
    fn template_disks_and_vapp_schema_are_read() {
        let config = json!({
            "hardware": {"device": [
                {"_typeName": "VirtualLsiLogicController", "key": 1000, "deviceInfo": {"label": "SCSI controller 0"}},
                {"_typeName": "VirtualDisk", "key": 2000, "deviceInfo": {"label": "Hard disk 1"}, "capacityInBytes": 21474836480i64},
                {"_typeName": "VirtualDisk", "key": 2001, "deviceInfo": {"label": "Hard disk 2"}, "capacityInKB": 1048576}
            ]},
            "vAppConfig": {"property": [
                {"key": 0, "id": "user-data", "defaultValue": ""},
                {"key": 1, "id": "hostname"}
            ]}
        });
        let props = parse_template_properties(&config).unwrap();
        assert_eq!(props.disks.len(), 2);
        assert_eq!(props.disks[0].label, "Hard disk 1");
        assert_eq!(props.disks[0].capacity_in_bytes, 20 * 1024 * 1024 * 1024);
        assert_eq!(props.disks[1].capacity_in_bytes, 1024 * 1024 * 1024);

        let vapp = props.vapp_properties.unwrap();
        assert_eq!(vapp[0].id, "user-data");
        assert_eq!(vapp[0].default_value.as_deref(), Some(""));
        assert_eq!(vapp[1].default_value, None);
    }

    #[test]
    fn template_without_vapp_config_reports_none() {
        let props = parse_template_properties(&json!({"hardware": {"device": []}})).unwrap();
        assert!(props.vapp_properties.is_none());
        assert!(props.disks.is_empty());
    }

    #[test]
    fn fault_messages_name_the_fault() {
        let body = json!({"_typeName": "InvalidLogin", "localizedMessage": "Cannot complete login"});
        assert_eq!(
            fault_message(StatusCode::INTERNAL_SERVER_ERROR, &body),
            "InvalidLogin: Cannot complete login"
        );
        assert_eq!(
            fault_message(StatusCode::BAD_GATEWAY, &Value::Null),
            "HTTP 502 Bad Gateway"
        );
    }

    #[test]
    fn clone_body_carries_placement_and_config() {
        let disk = VirtualDisk {
            key: 2000,
            label: "Hard disk 1".to_string(),
            capacity_in_bytes: 20 << 30,
            device: json!({"_typeName": "VirtualDisk", "key": 2000, "capacityInBytes": 20i64 << 30}),
        };
        let spec = CloneSpec {
            name: "worker-0".to_string(),
            folder: MoRef::new(KIND_FOLDER, "group-v4"),
            location: RelocateSpec {
                datastore: MoRef::new(KIND_DATASTORE, "datastore-11"),
                pool: MoRef::new(KIND_RESOURCE_POOL, "resgroup-8"),
                disk_move_type: DISK_MOVE_ALLOW_SHARING.to_string(),
            },
            power_on: true,
            config: VmConfigSpec {
                instance_uuid: Some("6f1c2d4e-0000-4000-8000-000000000001".to_string()),
                num_cpus: Some(4),
                memory_mb: None,
                annotation: "note".to_string(),
                disk_uuid_enabled: true,
                vapp_properties: vec![VAppPropertyEdit {
                    key: 0,
                    id: "hostname".to_string(),
                    value: "worker-0".to_string(),
                }],
                extra_config: [("guestinfo.userdata".to_string(), "abc".to_string())].into(),
                disk_resizes: vec![DiskResize {
                    disk,
                    capacity_in_bytes: 25 << 30,
                }],
            },
        };

        let body = clone_request_body(&spec);
        assert_eq!(body["name"], "worker-0");
        assert_eq!(body["spec"]["powerOn"], true);
        assert_eq!(body["spec"]["location"]["diskMoveType"], DISK_MOVE_ALLOW_SHARING);
        assert_eq!(body["spec"]["location"]["pool"]["value"], "resgroup-8");

        let config = &body["spec"]["config"];
        assert_eq!(config["numCPUs"], 4);
        assert!(config.get("memoryMB").is_none());
        assert_eq!(config["flags"]["diskUuidEnabled"], true);
        assert_eq!(config["vAppConfig"]["property"][0]["info"]["value"], "worker-0");
        assert_eq!(config["extraConfig"][0]["value"]["_value"], "abc");
        assert_eq!(config["deviceChange"][0]["operation"], "edit");
        assert_eq!(config["deviceChange"][0]["device"]["capacityInBytes"], 25i64 << 30);
        assert_eq!(config["deviceChange"][0]["device"]["capacityInKB"], (25i64 << 30) / 1024);
    }
}
