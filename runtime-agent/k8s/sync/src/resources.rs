//! Builds the desired cluster resources for a Director application.

use crate::naming;
use compass_runtime_agent_core::catalog;
use compass_runtime_agent_k8s_api::{
    self as k8s,
    application::{
        Authentication, CompassMetadata, CredentialsRef, CsrfInfo, Entry, EntryType, Service,
    },
    labels, ApplicationSpec, ByteString, ObjectMeta, Secret,
};
use std::collections::BTreeMap;

/// Everything the agent writes for one application.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Desired {
    pub spec: ApplicationSpec,
    pub secrets: Vec<Secret>,
}

pub(crate) fn desired(name: &str, namespace: &str, app: &catalog::Application) -> Desired {
    let mut services = Vec::with_capacity(app.services.len());
    let mut secrets = Vec::new();

    for svc in &app.services {
        let credentials = svc.credentials.as_ref().map(|creds| {
            let secret_name = naming::credentials_secret_name(name, &svc.id);
            secrets.push(secret(
                &secret_name,
                namespace,
                labels::owned_by(name, &svc.id),
                credentials_data(creds),
            ));
            CredentialsRef {
                kind: creds.type_name().to_string(),
                secret_name,
                authentication_url: creds.authentication_url().map(Into::into),
                csrf_info: svc.csrf.as_ref().map(|csrf| CsrfInfo {
                    token_endpoint_url: csrf.token_endpoint_url.clone(),
                }),
            }
        });

        let request_parameters_secret_name = svc
            .request_parameters
            .as_ref()
            .filter(|params| !params.is_empty())
            .map(|params| {
                let secret_name = naming::request_parameters_secret_name(name, &svc.id);
                secrets.push(secret(
                    &secret_name,
                    namespace,
                    labels::owned_by(name, &svc.id),
                    request_parameters_data(params),
                ));
                secret_name
            });

        services.push(Service {
            id: svc.id.clone(),
            name: naming::service_name(&svc.name),
            display_name: svc.name.clone(),
            description: svc.description.clone(),
            entries: svc.entries.iter().map(entry).collect(),
            credentials,
            request_parameters_secret_name,
        });
    }

    let spec = ApplicationSpec {
        description: app.description.clone(),
        provider_display_name: app.provider_display_name.clone(),
        labels: app.labels.clone(),
        services,
        compass_metadata: Some(CompassMetadata {
            application_id: app.id.clone(),
            authentication: Authentication {
                client_ids: app.client_ids.clone(),
            },
        }),
    };

    Desired { spec, secrets }
}

/// A new Application resource carrying `spec`.
pub(crate) fn application(name: &str, namespace: &str, spec: ApplicationSpec) -> k8s::Application {
    k8s::Application {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels::managed()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

/// Names of all secrets an Application spec refers to.
pub(crate) fn referenced_secrets(spec: &ApplicationSpec) -> impl Iterator<Item = &str> {
    spec.services.iter().flat_map(|svc| {
        svc.credentials
            .as_ref()
            .map(|c| c.secret_name.as_str())
            .into_iter()
            .chain(svc.request_parameters_secret_name.as_deref())
    })
}

fn entry(entry: &catalog::Entry) -> Entry {
    Entry {
        kind: match entry.kind {
            catalog::EntryKind::Api => EntryType::Api,
            catalog::EntryKind::Events => EntryType::Events,
        },
        id: entry.id.clone(),
        name: entry.name.clone(),
        target_url: entry.target_url.clone(),
        specification_url: entry.specification_url.clone(),
        api_type: entry.api_type.clone(),
    }
}

fn secret(
    name: &str,
    namespace: &str,
    labels: labels::Map,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn credentials_data(creds: &catalog::Credentials) -> BTreeMap<String, ByteString> {
    let pairs: Vec<(&str, &str)> = match creds {
        catalog::Credentials::OAuth {
            client_id,
            client_secret,
            url,
        } => vec![
            ("clientId", client_id.as_str()),
            ("clientSecret", client_secret.as_str()),
            ("url", url.as_str()),
        ],
        catalog::Credentials::Basic { username, password } => {
            vec![("username", username.as_str()), ("password", password.as_str())]
        }
        catalog::Credentials::CertificateGen { common_name } => {
            vec![("commonName", common_name.as_str())]
        }
    };
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

fn request_parameters_data(params: &catalog::RequestParameters) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::new();
    // Serializing string maps can't fail.
    if !params.headers.is_empty() {
        let json = serde_json::to_vec(&params.headers).unwrap_or_default();
        data.insert("headers".to_string(), ByteString(json));
    }
    if !params.query_parameters.is_empty() {
        let json = serde_json::to_vec(&params.query_parameters).unwrap_or_default();
        data.insert("queryParameters".to_string(), ByteString(json));
    }
    data
}
