use compass_runtime_agent_core::ClientCredentials;
use std::time::Duration;

/// Transport settings shared by the Connector and Director clients.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Bounds every request, including connection establishment.
    pub timeout: Duration,

    /// Disables server certificate verification. Only meant for test
    /// installations of Compass with self-signed certificates.
    pub skip_tls_verify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            skip_tls_verify: false,
        }
    }
}

/// Builds an HTTP client, optionally presenting `identity` and trusting its CA
/// chain in addition to the system roots.
pub(crate) fn client(
    config: &ClientConfig,
    identity: Option<&ClientCredentials>,
) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(config.timeout)
        .connect_timeout(config.timeout)
        .danger_accept_invalid_certs(config.skip_tls_verify);

    if let Some(credentials) = identity {
        let id = reqwest::Identity::from_pem(credentials.identity_pem().as_bytes())
            .map_err(|e| format!("invalid client identity: {e}"))?;
        builder = builder.identity(id);

        if !credentials.ca_chain_pem.trim().is_empty() {
            let roots = reqwest::Certificate::from_pem_bundle(credentials.ca_chain_pem.as_bytes())
                .map_err(|e| format!("invalid CA chain: {e}"))?;
            for root in roots {
                builder = builder.add_root_certificate(root);
            }
        }
    }

    builder.build().map_err(|e| e.to_string())
}
