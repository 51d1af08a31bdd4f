//! Shared types used by the Machine and Cluster resources

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Reference to a Secret holding sensitive data
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,

    /// Secret namespace; defaults to the referencing object's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Opaque provider configuration embedded in a Machine or Cluster spec
///
/// The value is decoded on demand with [`ProviderSpec::decode`] so a malformed
/// blob surfaces as a configuration error for the object instead of a watch
/// decode failure.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<serde_json::Value>,
}

impl ProviderSpec {
    /// Decode the provider configuration, treating an absent value as the default
    pub fn decode<T>(&self, object: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match &self.value {
            None => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::configuration_for_field(
                    object,
                    "spec.providerSpec.value",
                    format!("invalid provider config: {e}"),
                )
            }),
        }
    }
}

/// Network endpoint of a cluster's Kubernetes API
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Hostname or IP address
    pub host: String,

    /// Port number
    pub port: u16,
}

/// Schema for an opaque provider status blob
///
/// The blob is owned by the provider and must survive the API server's
/// structural schema pruning.
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::json!(true),
    );
    obj.into()
}
