use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An integrated system synchronized from Compass.
///
/// Other components (e.g. gateways) read these resources and write their
/// status; the agent owns the spec.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "applicationconnector.kyma-project.io",
    version = "v1alpha1",
    kind = "Application",
    namespaced,
    status = "ApplicationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_display_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compass_metadata: Option<CompassMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub entries: Vec<Entry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_parameters_secret_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specification_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_type: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum EntryType {
    #[serde(rename = "API")]
    Api,
    Events,
}

/// References the secret holding a service's credentials.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_info: Option<CsrfInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsrfInfo {
    #[serde(rename = "tokenEndpointURL")]
    pub token_endpoint_url: String,
}

/// Links the resource back to the Director application it was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompassMetadata {
    pub application_id: String,

    #[serde(default)]
    pub authentication: Authentication,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub client_ids: Vec<String>,
}

/// Written by the components that consume Applications.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_status: Option<InstallationStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct InstallationStatus {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// === impl Application ===

impl Application {
    /// The Director id this resource was synchronized from, if any.
    pub fn compass_id(&self) -> Option<&str> {
        self.spec
            .compass_metadata
            .as_ref()
            .map(|m| m.application_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_wire_names() {
        let entry = Entry {
            kind: EntryType::Api,
            id: "api-1".to_string(),
            name: "orders".to_string(),
            target_url: None,
            specification_url: None,
            api_type: None,
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            serde_json::json!({ "type": "API", "id": "api-1", "name": "orders" })
        );
    }

    #[test]
    fn credentials_reference_wire_names() {
        let json = serde_json::json!({
            "type": "OAuth",
            "secretName": "billing-svc-1",
            "authenticationUrl": "https://auth",
            "csrfInfo": { "tokenEndpointURL": "https://csrf" },
        });
        let creds: CredentialsRef = serde_json::from_value(json).unwrap();
        assert_eq!(creds.secret_name, "billing-svc-1");
        assert_eq!(
            creds.csrf_info.map(|c| c.token_endpoint_url).as_deref(),
            Some("https://csrf")
        );
    }
}
