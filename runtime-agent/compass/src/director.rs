use crate::{
    graphql::{self, Request},
    tls::{self, ClientConfig},
};
use compass_runtime_agent_core::{
    catalog::{
        Application, Catalog, Credentials, Csrf, Entry, EntryKind, Rejected, RequestParameters,
        Service,
    },
    ClientCredentials, DirectorClient, DirectorError, RuntimeTarget,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

const TENANT_HEADER: &str = "Tenant";

const APPLICATIONS_QUERY: &str = r#"query ($tenant: String!, $groupName: String!, $appName: String) {
  applications(tenant: $tenant, groupName: $groupName, appName: $appName) {
    id
    name
    description
    providerName
    labels
    systemAuths { id }
    services {
      id
      name
      description
      credentials {
        oauth { clientId clientSecret url }
        basic { username password }
        certificateGen { commonName }
        csrf { tokenEndpointURL }
      }
      requestParameters { headers queryParameters }
      entries { id name type targetUrl specificationUrl apiType }
    }
  }
}"#;

const SET_RUNTIME_LABEL_MUTATION: &str = r#"mutation ($runtimeId: ID!, $key: String!, $value: Any!) {
  setRuntimeLabel(runtimeID: $runtimeId, key: $key, value: $value) { key value }
}"#;

/// Queries the Director's GraphQL API, authenticating with the agent's
/// client certificate.
#[derive(Clone, Debug)]
pub struct GraphQlDirectorClient {
    config: ClientConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationsVars<'a> {
    tenant: &'a str,
    group_name: &'a str,
    app_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeLabelVars<'a> {
    runtime_id: &'a str,
    key: &'a str,
    value: &'a str,
}

/// Applications are decoded one at a time so that a malformed one does not
/// hide the rest.
#[derive(Debug, Deserialize)]
struct CatalogData {
    applications: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationDto {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    description: Option<String>,
    provider_name: Option<String>,
    labels: Option<BTreeMap<String, serde_json::Value>>,
    system_auths: Option<Vec<SystemAuthDto>>,
    services: Option<Vec<ServiceDto>>,
}

#[derive(Debug, Deserialize)]
struct SystemAuthDto {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDto {
    id: String,
    name: Option<String>,
    description: Option<String>,
    credentials: Option<CredentialsDto>,
    request_parameters: Option<RequestParametersDto>,
    entries: Option<Vec<EntryDto>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsDto {
    oauth: Option<OAuthDto>,
    basic: Option<BasicDto>,
    certificate_gen: Option<CertificateGenDto>,
    csrf: Option<CsrfDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthDto {
    client_id: String,
    client_secret: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct BasicDto {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateGenDto {
    common_name: String,
}

#[derive(Debug, Deserialize)]
struct CsrfDto {
    #[serde(rename = "tokenEndpointURL")]
    token_endpoint_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestParametersDto {
    headers: Option<BTreeMap<String, Vec<String>>>,
    query_parameters: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryDto {
    id: String,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    target_url: Option<String>,
    specification_url: Option<String>,
    api_type: Option<String>,
}

// === impl GraphQlDirectorClient ===

impl GraphQlDirectorClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    async fn execute<V, T>(
        &self,
        credentials: &ClientCredentials,
        target: &RuntimeTarget,
        query: &str,
        variables: V,
    ) -> Result<T, DirectorError>
    where
        V: Serialize + Send,
        T: DeserializeOwned,
    {
        let client = tls::client(&self.config, Some(credentials)).map_err(DirectorError::Tls)?;

        let rsp = client
            .post(&target.director_url)
            .header(TENANT_HEADER, &target.tenant)
            .json(&Request { query, variables })
            .send()
            .await
            .map_err(|e| DirectorError::Transport(e.to_string()))?;

        let status = rsp.status();
        let body = rsp
            .bytes()
            .await
            .map_err(|e| DirectorError::Transport(e.to_string()))?;
        if !status.is_success() {
            let detail = String::from_utf8_lossy(&body)
                .chars()
                .take(256)
                .collect::<String>();
            return Err(DirectorError::Transport(format!("HTTP {status}: {detail}")));
        }

        graphql::decode(&body)
    }
}

#[async_trait::async_trait]
impl DirectorClient for GraphQlDirectorClient {
    async fn fetch_catalog(
        &self,
        credentials: &ClientCredentials,
        target: &RuntimeTarget,
    ) -> Result<Catalog, DirectorError> {
        let vars = ApplicationsVars {
            tenant: &target.tenant,
            group_name: &target.runtime_id,
            app_name: None,
        };
        let data: CatalogData = self
            .execute(credentials, target, APPLICATIONS_QUERY, vars)
            .await?;
        let catalog = into_catalog(data);
        tracing::debug!(
            applications = catalog.len(),
            rejected = catalog.rejected.len(),
            "Fetched catalog"
        );
        Ok(catalog)
    }

    async fn set_runtime_labels(
        &self,
        credentials: &ClientCredentials,
        target: &RuntimeTarget,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DirectorError> {
        for (key, value) in labels {
            let vars = RuntimeLabelVars {
                runtime_id: &target.runtime_id,
                key,
                value,
            };
            let _: serde_json::Value = self
                .execute(credentials, target, SET_RUNTIME_LABEL_MUTATION, vars)
                .await?;
        }
        Ok(())
    }
}

fn into_catalog(data: CatalogData) -> Catalog {
    let mut catalog = Catalog::default();
    for value in data.applications.unwrap_or_default() {
        let id = value
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parsed = serde_json::from_value::<ApplicationDto>(value)
            .map_err(|e| DirectorError::Parse(e.to_string()))
            .and_then(ApplicationDto::try_into_application);
        match parsed {
            Ok(app) => catalog.applications.push(app),
            Err(error) => {
                tracing::warn!(%id, %error, "Skipping malformed application");
                catalog.rejected.push(Rejected {
                    id,
                    reason: error.to_string(),
                });
            }
        }
    }
    catalog
}

#[cfg(test)]
fn parse_catalog(body: &[u8]) -> Result<Catalog, DirectorError> {
    graphql::decode(body).map(into_catalog)
}

impl ApplicationDto {
    fn try_into_application(self) -> Result<Application, DirectorError> {
        if self.id.is_empty() || self.name.is_empty() {
            return Err(DirectorError::Parse(format!(
                "application {:?} has an empty id or name",
                self.id
            )));
        }

        let labels = self
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, label_value(v)))
            .collect();

        let services = self
            .services
            .unwrap_or_default()
            .into_iter()
            .map(|svc| svc.try_into_service(&self.id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Application {
            id: self.id,
            name: self.name,
            description: self.description,
            provider_display_name: self.provider_name,
            labels,
            services,
            client_ids: self
                .system_auths
                .unwrap_or_default()
                .into_iter()
                .map(|a| a.id)
                .collect(),
        })
    }
}

impl ServiceDto {
    fn try_into_service(self, app_id: &str) -> Result<Service, DirectorError> {
        if self.id.is_empty() {
            return Err(DirectorError::Parse(format!(
                "application {app_id:?} has a service without an id"
            )));
        }

        let (credentials, csrf) = match self.credentials {
            Some(CredentialsDto {
                oauth,
                basic,
                certificate_gen,
                csrf,
            }) => {
                let credentials = match (oauth, basic, certificate_gen) {
                    (Some(o), _, _) => Some(Credentials::OAuth {
                        client_id: o.client_id,
                        client_secret: o.client_secret,
                        url: o.url,
                    }),
                    (None, Some(b), _) => Some(Credentials::Basic {
                        username: b.username,
                        password: b.password,
                    }),
                    (None, None, Some(c)) => Some(Credentials::CertificateGen {
                        common_name: c.common_name,
                    }),
                    (None, None, None) => None,
                };
                let csrf = csrf
                    .and_then(|c| c.token_endpoint_url)
                    .filter(|url| !url.is_empty())
                    .map(|token_endpoint_url| Csrf { token_endpoint_url });
                (credentials, csrf)
            }
            None => (None, None),
        };

        let request_parameters = self
            .request_parameters
            .map(|p| RequestParameters {
                headers: p.headers.unwrap_or_default(),
                query_parameters: p.query_parameters.unwrap_or_default(),
            })
            .filter(|p| !p.is_empty());

        let entries = self
            .entries
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.try_into_entry(&self.id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Service {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            description: self.description,
            entries,
            credentials,
            csrf,
            request_parameters,
        })
    }
}

impl EntryDto {
    fn try_into_entry(self, service_id: &str) -> Result<Entry, DirectorError> {
        let kind = match self.kind.to_ascii_uppercase().as_str() {
            "API" => EntryKind::Api,
            "EVENTS" | "EVENT" => EntryKind::Events,
            other => {
                return Err(DirectorError::Parse(format!(
                    "service {service_id:?} has an entry of unknown type {other:?}"
                )))
            }
        };
        Ok(Entry {
            kind,
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            target_url: self.target_url,
            specification_url: self.specification_url,
            api_type: self.api_type,
        })
    }
}

fn label_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(values) => values
            .into_iter()
            .map(label_value)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}
