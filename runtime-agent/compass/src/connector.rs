use crate::tls::{self, ClientConfig};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use compass_runtime_agent_core::{
    certificate,
    connector::{CertificateChain, ConnectionInfo},
    ClientCredentials, ConnectorClient, ConnectorError, ErrorCode,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

const TOKEN_HEADER: &str = "Connector-Token";

/// Talks to the Connector's REST API.
#[derive(Clone, Debug)]
pub struct HttpConnectorClient {
    config: ClientConfig,

    /// Used for calls authorized by the one-time token.
    bootstrap: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    csr_url: String,
    #[serde(default)]
    api: ApiUrls,
    certificate: CertificateTemplate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUrls {
    director_url: Option<String>,
    certificates_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CertificateTemplate {
    subject: String,
    #[serde(default, rename = "key-algorithm")]
    key_algorithm: String,
}

#[derive(Debug, Serialize)]
struct CsrRequest {
    csr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrtResponse {
    crt: String,
    client_crt: Option<String>,
    ca_crt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    error: String,
}

// === impl HttpConnectorClient ===

impl HttpConnectorClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConnectorError> {
        let bootstrap = tls::client(&config, None).map_err(ConnectorError::InvalidResponse)?;
        Ok(Self { config, bootstrap })
    }
}

#[async_trait::async_trait]
impl ConnectorClient for HttpConnectorClient {
    async fn establish_connection(
        &self,
        connector_url: &str,
        token: &str,
    ) -> Result<ConnectionInfo, ConnectorError> {
        let rsp = self
            .bootstrap
            .get(connector_url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let status = rsp.status();
        let body = rsp
            .bytes()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        if status != StatusCode::OK {
            return Err(parse_error(status, &body));
        }
        parse_info(&body)
    }

    async fn request_certificate(
        &self,
        csr_der: &[u8],
        url: &str,
        identity: Option<&ClientCredentials>,
    ) -> Result<CertificateChain, ConnectorError> {
        let client = match identity {
            Some(credentials) => tls::client(&self.config, Some(credentials))
                .map_err(ConnectorError::InvalidResponse)?,
            None => self.bootstrap.clone(),
        };

        let rsp = client
            .post(url)
            .json(&CsrRequest {
                csr: STANDARD.encode(csr_der),
            })
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let status = rsp.status();
        let body = rsp
            .bytes()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        if status != StatusCode::CREATED {
            return Err(parse_error(status, &body));
        }
        parse_certificate_response(&body)
    }
}

fn parse_info(body: &[u8]) -> Result<ConnectionInfo, ConnectorError> {
    let InfoResponse {
        csr_url,
        api,
        certificate,
    } = serde_json::from_slice(body).map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

    let director_url = api
        .director_url
        .ok_or_else(|| ConnectorError::InvalidResponse("missing api.directorUrl".to_string()))?;
    let certificates_url = api.certificates_url.ok_or_else(|| {
        ConnectorError::InvalidResponse("missing api.certificatesUrl".to_string())
    })?;

    Ok(ConnectionInfo {
        csr_url,
        director_url,
        certificates_url,
        subject: certificate.subject,
        key_algorithm: certificate.key_algorithm,
    })
}

fn parse_certificate_response(body: &[u8]) -> Result<CertificateChain, ConnectorError> {
    let rsp: CrtResponse =
        serde_json::from_slice(body).map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

    if let (Some(client), Some(ca)) = (&rsp.client_crt, &rsp.ca_crt) {
        return Ok(CertificateChain {
            certificate_pem: decode_pem(client)?,
            ca_chain_pem: decode_pem(ca)?,
        });
    }

    let chain = decode_pem(&rsp.crt)?;
    let (certificate_pem, ca_chain_pem) = certificate::split_chain(&chain)
        .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
    Ok(CertificateChain {
        certificate_pem,
        ca_chain_pem,
    })
}

fn decode_pem(encoded: &str) -> Result<String, ConnectorError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ConnectorError::InvalidResponse(format!("invalid base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ConnectorError::InvalidResponse(e.to_string()))
}

/// Error bodies are `{"code": <int>, "error": <message>}`. Anything else is
/// classified by its HTTP status.
fn parse_error(status: StatusCode, body: &[u8]) -> ConnectorError {
    let (code, message) = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { code, error }) => (ErrorCode::from(code), error),
        Err(_) => {
            let code = match status {
                StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ErrorCode::Forbidden,
                StatusCode::NOT_FOUND => ErrorCode::NotFound,
                StatusCode::CONFLICT => ErrorCode::AlreadyExists,
                s if s.is_client_error() => ErrorCode::WrongInput,
                _ => ErrorCode::Internal,
            };
            let message = String::from_utf8_lossy(body).chars().take(256).collect();
            (code, message)
        }
    };
    ConnectorError::Response {
        status: status.as_u16(),
        code,
        message,
    }
}
