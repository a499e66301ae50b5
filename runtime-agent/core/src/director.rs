//! The contract of the Compass Director, which declares the applications
//! assigned to this runtime.

use crate::{catalog::Catalog, ClientCredentials, ErrorKind};
use std::collections::BTreeMap;

#[async_trait::async_trait]
pub trait DirectorClient: Send + Sync {
    /// Fetches every application assigned to the runtime. Malformed
    /// applications are returned as rejected rather than failing the fetch.
    ///
    /// Requests authenticate with `credentials`; callers must pass the
    /// certificate produced by the most recent renewal.
    async fn fetch_catalog(
        &self,
        credentials: &ClientCredentials,
        target: &RuntimeTarget,
    ) -> Result<Catalog, DirectorError>;

    /// Publishes runtime labels (e.g. the event gateway URL) to the Director.
    async fn set_runtime_labels(
        &self,
        credentials: &ClientCredentials,
        target: &RuntimeTarget,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DirectorError>;
}

/// Identifies the Director endpoint and the runtime on whose behalf the agent
/// queries it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeTarget {
    pub director_url: String,
    pub tenant: String,
    pub runtime_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("director request failed: {0}")]
    Transport(String),

    #[error("director returned errors: {}", .0.join("; "))]
    GraphQl(Vec<String>),

    #[error("malformed director response: {0}")]
    Parse(String),

    #[error("failed to configure director TLS: {0}")]
    Tls(String),
}

// === impl DirectorError ===

impl DirectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::GraphQl(_) => ErrorKind::Upstream,
            Self::Parse(_) => ErrorKind::WrongInput,
            Self::Tls(_) => ErrorKind::Internal,
        }
    }
}
