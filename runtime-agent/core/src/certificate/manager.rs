use super::{
    parse_certificate, should_renew, CertificateError, CertificateRequest, RenewalError, Subject,
};
use crate::{connector::ConnectionInfo, ClientCredentials, ConnectorClient};
use chrono::{DateTime, Utc};

/// Decides when the client certificate must be renewed and obtains new
/// certificates from the Connector.
///
/// The manager never retries: failures are returned so that the reconcile
/// loop applies its own requeue policy.
#[derive(Clone, Debug)]
pub struct CertificateManager<C> {
    connector: C,
    renewal_threshold: f64,
}

impl<C: ConnectorClient> CertificateManager<C> {
    pub fn new(connector: C, renewal_threshold: f64) -> Self {
        Self {
            connector,
            renewal_threshold,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn should_renew(
        &self,
        credentials: &ClientCredentials,
        now: DateTime<Utc>,
    ) -> Result<bool, CertificateError> {
        let info = credentials.certificate()?;
        Ok(should_renew(
            info.not_before,
            info.not_after,
            now,
            self.renewal_threshold,
        ))
    }

    /// Requests the first certificate using the subject template returned by
    /// the token exchange.
    pub async fn establish(
        &self,
        info: &ConnectionInfo,
    ) -> Result<ClientCredentials, RenewalError> {
        let subject = info.subject.parse::<Subject>()?;
        if info.key_algorithm != "rsa2048" && !info.key_algorithm.is_empty() {
            tracing::debug!(
                key_algorithm = %info.key_algorithm,
                "Unsupported key algorithm; using ECDSA P-256"
            );
        }
        self.request(&subject, &info.csr_url, None).await
    }

    /// Requests a new certificate carrying the subject of the current one.
    pub async fn renew(
        &self,
        current: &ClientCredentials,
        certificates_url: &str,
    ) -> Result<ClientCredentials, RenewalError> {
        let subject = current.certificate()?.subject;
        let url = format!("{}/renewals", certificates_url.trim_end_matches('/'));
        let mut renewed = self.request(&subject, &url, Some(current)).await?;
        if renewed.ca_chain_pem.trim().is_empty() {
            renewed.ca_chain_pem = current.ca_chain_pem.clone();
        }
        Ok(renewed)
    }

    async fn request(
        &self,
        subject: &Subject,
        url: &str,
        identity: Option<&ClientCredentials>,
    ) -> Result<ClientCredentials, RenewalError> {
        let request = CertificateRequest::generate(subject)?;
        let chain = self
            .connector
            .request_certificate(request.csr_der(), url, identity)
            .await?;

        let issued = parse_certificate(&chain.certificate_pem)?;
        tracing::info!(
            subject = %issued.subject,
            not_after = %issued.not_after,
            "Issued client certificate"
        );

        Ok(ClientCredentials {
            key_pem: request.into_key_pem(),
            certificate_pem: chain.certificate_pem,
            ca_chain_pem: chain.ca_chain_pem,
        })
    }
}
