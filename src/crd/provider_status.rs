//! Provider status records stored in Machine and Cluster status
//!
//! "No status yet" and "status with empty fields" are different states: the
//! `from_*` readers return `Ok(None)` when no blob has been written.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::cluster::Cluster;
use super::machine::Machine;
use crate::{Error, Result};

/// Progress record for one Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VsphereMachineProviderStatus {
    /// Managed object id of the provisioned VM; empty until the clone succeeds
    pub machine_ref: String,

    /// In-flight task reference; empty when no task is outstanding
    pub task_ref: String,

    /// RFC 3339 time of the last write
    pub last_updated: String,
}

impl VsphereMachineProviderStatus {
    /// Read the status blob from a Machine, `None` if none has been written
    pub fn from_machine(machine: &Machine) -> Result<Option<Self>> {
        let blob = machine
            .status
            .as_ref()
            .and_then(|s| s.provider_status.as_ref());
        match blob {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    Error::serialization_for_kind(
                        "VsphereMachineProviderStatus",
                        format!("cannot decode provider status: {e}"),
                    )
                }),
        }
    }

    /// Encode for storage under `status.providerStatus`
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Stamp `last_updated` with the current time
    pub fn touch(&mut self) {
        self.last_updated = now_rfc3339();
    }
}

/// Provider status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VsphereClusterProviderStatus {
    /// RFC 3339 time of the last machine change observed in this cluster
    pub last_updated: String,
}

impl VsphereClusterProviderStatus {
    /// Read the status blob from a Cluster, `None` if none has been written
    pub fn from_cluster(cluster: &Cluster) -> Result<Option<Self>> {
        let blob = cluster
            .status
            .as_ref()
            .and_then(|s| s.provider_status.as_ref());
        match blob {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    Error::serialization_for_kind(
                        "VsphereClusterProviderStatus",
                        format!("cannot decode provider status: {e}"),
                    )
                }),
        }
    }
}

/// Current time as RFC 3339 with second precision and a `Z` suffix
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineSpec, MachineStatus};

    fn machine_with_blob(blob: Option<serde_json::Value>) -> Machine {
        let mut machine = Machine::new("worker-0", MachineSpec::default());
        machine.status = Some(MachineStatus {
            provider_status: blob,
            addresses: vec![],
        });
        machine
    }

    #[test]
    fn stored_record_round_trips() {
        let status = VsphereMachineProviderStatus {
            machine_ref: "vm-1".to_string(),
            task_ref: String::new(),
            last_updated: "2024-01-01T00:00:00Z".to_string(),
        };
        let machine = machine_with_blob(Some(status.to_value().unwrap()));
        let read = VsphereMachineProviderStatus::from_machine(&machine)
            .unwrap()
            .unwrap();
        assert_eq!(read, status);
    }

    #[test]
    fn absent_blob_is_distinct_from_empty_record() {
        let machine = Machine::new("worker-0", MachineSpec::default());
        assert_eq!(VsphereMachineProviderStatus::from_machine(&machine).unwrap(), None);

        let machine = machine_with_blob(Some(serde_json::json!({})));
        assert_eq!(
            VsphereMachineProviderStatus::from_machine(&machine).unwrap(),
            Some(VsphereMachineProviderStatus::default())
        );
    }

    #[test]
    fn wire_keys_are_camel_case() {
        let status = VsphereMachineProviderStatus {
            machine_ref: "vm-9".to_string(),
            task_ref: "task-3".to_string(),
            last_updated: "2024-01-01T00:00:00Z".to_string(),
        };
        let json = status.to_value().unwrap();
        assert_eq!(json["machineRef"], "vm-9");
        assert_eq!(json["taskRef"], "task-3");
        assert_eq!(json["lastUpdated"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn malformed_blob_is_a_serialization_error() {
        let machine = machine_with_blob(Some(serde_json::json!({"machineRef": 5})));
        assert!(matches!(
            VsphereMachineProviderStatus::from_machine(&machine),
            Err(Error::Serialization { .. })
        ));
    }

    #[test]
    fn timestamps_use_zulu_seconds() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(!ts.contains('.'));
    }
}
