//! The contract of the Compass Connector, which issues and renews the
//! agent's client certificates.

use crate::{ClientCredentials, ErrorKind};
use std::fmt;

/// Issues client certificates from certificate signing requests.
#[async_trait::async_trait]
pub trait ConnectorClient: Send + Sync {
    /// Exchanges a one-time token for the metadata needed to request the
    /// first certificate.
    async fn establish_connection(
        &self,
        connector_url: &str,
        token: &str,
    ) -> Result<ConnectionInfo, ConnectorError>;

    /// Submits a DER-encoded CSR to `url`.
    ///
    /// Renewals authenticate with the current `identity`; the first request
    /// is authorized by the URL handed out with the one-time token.
    async fn request_certificate(
        &self,
        csr_der: &[u8],
        url: &str,
        identity: Option<&ClientCredentials>,
    ) -> Result<CertificateChain, ConnectorError>;
}

/// Returned by the token exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Where the first CSR must be submitted.
    pub csr_url: String,
    pub director_url: String,

    /// Base URL of the mTLS-secured certificate API used for renewals.
    pub certificates_url: String,

    /// Subject template, e.g. `O=Org,OU=OrgUnit,L=Waldorf,ST=Waldorf,C=DE,CN=runtime`.
    pub subject: String,
    pub key_algorithm: String,
}

/// A freshly issued client certificate and the chain that signed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateChain {
    pub certificate_pem: String,
    pub ca_chain_pem: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector responded {status} ({code}): {message}")]
    Response {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("connector request failed: {0}")]
    Transport(String),

    #[error("invalid connector response: {0}")]
    InvalidResponse(String),
}

/// Error codes carried in the Connector's error bodies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Internal,
    NotFound,
    AlreadyExists,
    WrongInput,
    UpstreamServerCallFailed,
    Forbidden,
    Unknown(i64),
}

#[async_trait::async_trait]
impl<C: ConnectorClient + ?Sized> ConnectorClient for std::sync::Arc<C> {
    async fn establish_connection(
        &self,
        connector_url: &str,
        token: &str,
    ) -> Result<ConnectionInfo, ConnectorError> {
        (**self).establish_connection(connector_url, token).await
    }

    async fn request_certificate(
        &self,
        csr_der: &[u8],
        url: &str,
        identity: Option<&ClientCredentials>,
    ) -> Result<CertificateChain, ConnectorError> {
        (**self).request_certificate(csr_der, url, identity).await
    }
}

// === impl ConnectorError ===

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Response { code, .. } => code.kind(),
            Self::Transport(_) => ErrorKind::Upstream,
            Self::InvalidResponse(_) => ErrorKind::Internal,
        }
    }
}

// === impl ErrorCode ===

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::WrongInput | Self::Forbidden | Self::NotFound => ErrorKind::WrongInput,
            Self::AlreadyExists => ErrorKind::Conflict,
            Self::Internal | Self::UpstreamServerCallFailed | Self::Unknown(_) => {
                ErrorKind::Upstream
            }
        }
    }

    /// True if the same request may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            1 => Self::Internal,
            2 => Self::NotFound,
            3 => Self::AlreadyExists,
            4 => Self::WrongInput,
            5 => Self::UpstreamServerCallFailed,
            6 => Self::Forbidden,
            code => Self::Unknown(code),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => f.write_str("CodeInternal"),
            Self::NotFound => f.write_str("CodeNotFound"),
            Self::AlreadyExists => f.write_str("CodeAlreadyExists"),
            Self::WrongInput => f.write_str("CodeWrongInput"),
            Self::UpstreamServerCallFailed => f.write_str("CodeUpstreamServerCallFailed"),
            Self::Forbidden => f.write_str("CodeForbidden"),
            Self::Unknown(code) => write!(f, "Code({code})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_retry_policy() {
        assert_eq!(ErrorCode::from(1), ErrorCode::Internal);
        assert_eq!(ErrorCode::from(4), ErrorCode::WrongInput);
        assert_eq!(ErrorCode::from(42), ErrorCode::Unknown(42));

        assert!(ErrorCode::Internal.is_retryable());
        assert!(ErrorCode::UpstreamServerCallFailed.kind().is_retryable());
        assert!(!ErrorCode::WrongInput.kind().is_retryable());
        assert!(!ErrorCode::Forbidden.is_retryable());
    }

    #[test]
    fn response_error_names_code() {
        let error = ConnectorError::Response {
            status: 400,
            code: ErrorCode::WrongInput,
            message: "invalid CSR".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "connector responded 400 (CodeWrongInput): invalid CSR"
        );
        assert_eq!(error.kind(), ErrorKind::WrongInput);
    }
}
