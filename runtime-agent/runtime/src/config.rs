//! The agent configuration provisioned alongside the agent: where the
//! Connector is and which runtime and tenant the agent acts for.

use crate::k8s::{Api, ByteString, Client, Secret};
use async_trait::async_trait;
use compass_runtime_agent_core::ErrorKind;
use std::{collections::BTreeMap, fmt, str::FromStr};

pub const CONNECTOR_URL_KEY: &str = "CONNECTOR_URL";
pub const TOKEN_KEY: &str = "TOKEN";
pub const RUNTIME_ID_KEY: &str = "RUNTIME_ID";
pub const TENANT_KEY: &str = "TENANT";

#[derive(Clone, PartialEq, Eq)]
pub struct AgentConfiguration {
    pub connector_url: String,

    /// One-time token exchanged with the Connector for a first certificate.
    pub token: String,
    pub runtime_id: String,
    pub tenant: String,
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get(&self) -> Result<AgentConfiguration, ConfigError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("agent configuration secret {0} not found")]
    NotFound(SecretRef),

    #[error("agent configuration is missing {0}")]
    MissingKey(&'static str),

    #[error("agent configuration key {0} is not valid UTF-8")]
    NotUtf8(&'static str),

    #[error("failed to read agent configuration: {0}")]
    Kube(#[from] kube::Error),
}

/// Identifies a secret as `namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("expected a secret reference of the form namespace/name: {0}")]
pub struct InvalidSecretRef(String);

/// Reads the configuration from a secret on every call, so that a fixed
/// secret is picked up without a restart.
#[derive(Clone)]
pub struct SecretConfigProvider {
    api: Api<Secret>,
    secret: SecretRef,
}

/// A fixed configuration.
#[derive(Clone, Debug)]
pub struct StaticConfigProvider(pub AgentConfiguration);

// === impl AgentConfiguration ===

impl AgentConfiguration {
    pub fn from_data(data: &BTreeMap<String, ByteString>) -> Result<Self, ConfigError> {
        fn required(
            data: &BTreeMap<String, ByteString>,
            key: &'static str,
        ) -> Result<String, ConfigError> {
            let ByteString(bytes) = data.get(key).ok_or(ConfigError::MissingKey(key))?;
            let value = std::str::from_utf8(bytes).map_err(|_| ConfigError::NotUtf8(key))?;
            let value = value.trim();
            if value.is_empty() {
                return Err(ConfigError::MissingKey(key));
            }
            Ok(value.to_string())
        }

        Ok(Self {
            connector_url: required(data, CONNECTOR_URL_KEY)?,
            token: required(data, TOKEN_KEY)?,
            runtime_id: required(data, RUNTIME_ID_KEY)?,
            tenant: required(data, TENANT_KEY)?,
        })
    }
}

impl fmt::Debug for AgentConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfiguration")
            .field("connector_url", &self.connector_url)
            .field("runtime_id", &self.runtime_id)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

// === impl ConfigError ===

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Kube(_) => ErrorKind::Upstream,
            _ => ErrorKind::WrongInput,
        }
    }
}

// === impl SecretRef ===

impl FromStr for SecretRef {
    type Err = InvalidSecretRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(InvalidSecretRef(s.to_string())),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl SecretConfigProvider ===

impl SecretConfigProvider {
    pub fn new(client: Client, secret: SecretRef) -> Self {
        Self {
            api: Api::namespaced(client, &secret.namespace),
            secret,
        }
    }
}

#[async_trait]
impl ConfigProvider for SecretConfigProvider {
    async fn get(&self) -> Result<AgentConfiguration, ConfigError> {
        let secret = self
            .api
            .get_opt(&self.secret.name)
            .await?
            .ok_or_else(|| ConfigError::NotFound(self.secret.clone()))?;
        AgentConfiguration::from_data(&secret.data.unwrap_or_default())
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn get(&self) -> Result<AgentConfiguration, ConfigError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn reads_all_keys() {
        let config = AgentConfiguration::from_data(&data(&[
            (CONNECTOR_URL_KEY, "https://connector.example.com/graphql\n"),
            (TOKEN_KEY, "tok"),
            (RUNTIME_ID_KEY, "rt-1"),
            (TENANT_KEY, "tenant-1"),
        ]))
        .unwrap();
        assert_eq!(config.connector_url, "https://connector.example.com/graphql");
        assert_eq!(config.runtime_id, "rt-1");
        assert!(!format!("{config:?}").contains("tok"));
    }

    #[test]
    fn missing_or_empty_keys_are_reported() {
        let error = AgentConfiguration::from_data(&data(&[(CONNECTOR_URL_KEY, "https://c")]))
            .unwrap_err();
        assert_eq!(error.to_string(), "agent configuration is missing TOKEN");
        assert_eq!(error.kind(), ErrorKind::WrongInput);

        let empty = btreemap! {
            CONNECTOR_URL_KEY.to_string() => ByteString(b"https://c".to_vec()),
            TOKEN_KEY.to_string() => ByteString(b"  ".to_vec()),
        };
        assert!(matches!(
            AgentConfiguration::from_data(&empty),
            Err(ConfigError::MissingKey(TOKEN_KEY))
        ));
    }

    #[test]
    fn secret_refs() {
        assert_eq!(
            "kyma-system/compass-agent-configuration"
                .parse::<SecretRef>()
                .unwrap(),
            SecretRef {
                namespace: "kyma-system".to_string(),
                name: "compass-agent-configuration".to_string(),
            }
        );
        assert!("compass-agent-configuration".parse::<SecretRef>().is_err());
        assert!("a/b/c".parse::<SecretRef>().is_err());
        assert!("/b".parse::<SecretRef>().is_err());
    }
}
