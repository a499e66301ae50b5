use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The name of the singleton CompassConnection resource.
pub const NAME: &str = "compass-connection";

/// Records the state of the runtime's connection to Compass.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "compass.kyma-project.io",
    version = "v1alpha1",
    kind = "CompassConnection",
    status = "CompassConnectionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompassConnectionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_info: Option<ManagementInfo>,

    /// Requests a certificate renewal on the next reconcile.
    #[serde(default)]
    pub refresh_credentials_now: bool,

    /// Requests a synchronization on the next reconcile, regardless of when
    /// the last one ran.
    #[serde(default)]
    pub resync_now: bool,
}

/// Endpoints learned while establishing the connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagementInfo {
    pub connector_url: String,
    pub director_url: String,
    pub certificates_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompassConnectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub established: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub renewed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_sync: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_sync_success: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateStatus>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConnectionState {
    Connected,
    ConnectionFailed,
    Synchronized,
    SynchronizationFailed,
}

/// The validity window of the client certificate currently in use.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[schemars(with = "String")]
    pub not_before: DateTime<Utc>,
    #[schemars(with = "String")]
    pub not_after: DateTime<Utc>,
}

// === impl CompassConnection ===

impl CompassConnection {
    /// An empty connection, as created on first boot.
    pub fn empty() -> Self {
        Self::new(NAME, CompassConnectionSpec::default())
    }

    pub fn state(&self) -> Option<ConnectionState> {
        self.status.as_ref().and_then(|s| s.state)
    }
}

// === impl ConnectionState ===

impl ConnectionState {
    /// True once a certificate has been obtained.
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::ConnectionFailed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_camel_case() {
        let status = CompassConnectionStatus {
            state: Some(ConnectionState::SynchronizationFailed),
            last_sync_status: Some("director unreachable".to_string()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({
                "state": "SynchronizationFailed",
                "lastSyncStatus": "director unreachable",
            })
        );
    }

    #[test]
    fn empty_spec_deserializes() {
        let spec: CompassConnectionSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec, CompassConnectionSpec::default());
    }
}
