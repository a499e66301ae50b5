use crate::{
    config::SecretRef,
    k8s::{Api, ByteString, Client, ObjectMeta, Patch, PatchParams, Secret},
};
use async_trait::async_trait;
use compass_runtime_agent_core::{ClientCredentials, CredentialStore, StoreError};
use std::collections::BTreeMap;

/// Holds the client certificate followed by its private key.
pub const CERTIFICATE_KEY: &str = "crt";

/// Holds the CA chain used to verify Compass.
pub const CA_CERTIFICATE_KEY: &str = "ca.crt";

const FIELD_MANAGER: &str = "compass-runtime-agent";

/// Stores credentials in a single secret, so the certificate, its key and
/// the CA chain are always replaced together.
#[derive(Clone)]
pub struct SecretCredentialStore {
    api: Api<Secret>,
    secret: SecretRef,
}

impl SecretCredentialStore {
    pub fn new(client: Client, secret: SecretRef) -> Self {
        Self {
            api: Api::namespaced(client, &secret.namespace),
            secret,
        }
    }
}

#[async_trait]
impl CredentialStore for SecretCredentialStore {
    async fn get(&self) -> Result<Option<ClientCredentials>, StoreError> {
        let secret = self
            .api
            .get_opt(&self.secret.name)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        match secret.and_then(|s| s.data) {
            Some(data) => decode(&data),
            None => Ok(None),
        }
    }

    async fn put(&self, credentials: &ClientCredentials) -> Result<(), StoreError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.secret.name.clone()),
                namespace: Some(self.secret.namespace.clone()),
                ..Default::default()
            },
            data: Some(encode(credentials)),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        self.api
            .patch(
                &self.secret.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(secret),
            )
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        tracing::debug!(secret = %self.secret, "Stored client credentials");
        Ok(())
    }
}

fn encode(credentials: &ClientCredentials) -> BTreeMap<String, ByteString> {
    [
        (CERTIFICATE_KEY, credentials.identity_pem()),
        (CA_CERTIFICATE_KEY, credentials.ca_chain_pem.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ByteString(v.into_bytes())))
    .collect()
}

/// Splits the stored identity back into its certificate and key. A secret
/// without a certificate is treated as absent.
fn decode(data: &BTreeMap<String, ByteString>) -> Result<Option<ClientCredentials>, StoreError> {
    let Some(ByteString(identity)) = data.get(CERTIFICATE_KEY).filter(|b| !b.0.is_empty()) else {
        return Ok(None);
    };

    let blocks = ::pem::parse_many(identity).map_err(|e| StoreError::Malformed(e.to_string()))?;
    let mut certificates = Vec::new();
    let mut key = None;
    for block in blocks {
        if block.tag() == "CERTIFICATE" {
            certificates.push(block);
        } else if block.tag().ends_with("PRIVATE KEY") {
            key = Some(block);
        }
    }
    let key = key.ok_or_else(|| {
        StoreError::Malformed(format!("{CERTIFICATE_KEY} holds no private key"))
    })?;
    if certificates.is_empty() {
        return Err(StoreError::Malformed(format!(
            "{CERTIFICATE_KEY} holds no certificate"
        )));
    }

    let ca_chain_pem = match data.get(CA_CERTIFICATE_KEY) {
        Some(ByteString(bytes)) => String::from_utf8(bytes.clone()).map_err(|_| {
            StoreError::Malformed(format!("{CA_CERTIFICATE_KEY} is not valid UTF-8"))
        })?,
        None => String::new(),
    };

    Ok(Some(ClientCredentials {
        key_pem: ::pem::encode(&key),
        certificate_pem: ::pem::encode_many(&certificates),
        ca_chain_pem,
    }))
}
