//! The Director's view of the integrated systems assigned to this runtime.

use std::{collections::BTreeMap, fmt};

/// The applications the Director assigns to this runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    pub applications: Vec<Application>,

    /// Applications the Director returned that could not be understood. The
    /// cluster state of these is left untouched.
    pub rejected: Vec<Rejected>,
}

/// A malformed catalog entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejected {
    /// The Director id, if the entry carried one.
    pub id: String,
    pub reason: String,
}

/// An integrated system, as declared by the Director for this runtime's tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Application {
    /// Director-assigned identifier. Never changes for the lifetime of the
    /// application in the control plane.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub provider_display_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub services: Vec<Service>,

    /// OAuth client ids of the system auths registered for the application.
    pub client_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub entries: Vec<Entry>,
    pub credentials: Option<Credentials>,
    pub csrf: Option<Csrf>,
    pub request_parameters: Option<RequestParameters>,
}

/// An API or event definition exposed by a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub id: String,
    pub name: String,
    pub target_url: Option<String>,
    pub specification_url: Option<String>,
    pub api_type: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Api,
    Events,
}

/// Credentials used by gateways to call the integrated system.
///
/// The agent never stores these inline on an Application; they are written to
/// a secret and referenced by name.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    OAuth {
        client_id: String,
        client_secret: String,
        url: String,
    },
    Basic {
        username: String,
        password: String,
    },
    CertificateGen {
        common_name: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Csrf {
    pub token_endpoint_url: String,
}

/// Additional headers and query parameters sent with every proxied request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestParameters {
    pub headers: BTreeMap<String, Vec<String>>,
    pub query_parameters: BTreeMap<String, Vec<String>>,
}

// === impl Catalog ===

impl Catalog {
    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    /// True if the Director id belongs to a rejected entry.
    pub fn is_rejected(&self, id: &str) -> bool {
        self.rejected.iter().any(|r| r.id == id)
    }
}

impl FromIterator<Application> for Catalog {
    fn from_iter<I: IntoIterator<Item = Application>>(iter: I) -> Self {
        Self {
            applications: iter.into_iter().collect(),
            rejected: Vec::new(),
        }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            f.write_str(&self.reason)
        } else {
            write!(f, "{}: {}", self.id, self.reason)
        }
    }
}

// === impl Credentials ===

impl Credentials {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::OAuth { .. } => "OAuth",
            Self::Basic { .. } => "Basic",
            Self::CertificateGen { .. } => "CertificateGen",
        }
    }

    /// The token endpoint for OAuth credentials.
    pub fn authentication_url(&self) -> Option<&str> {
        match self {
            Self::OAuth { url, .. } => Some(url),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth { client_id, url, .. } => f
                .debug_struct("OAuth")
                .field("client_id", client_id)
                .field("url", url)
                .finish_non_exhaustive(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::CertificateGen { common_name } => f
                .debug_struct("CertificateGen")
                .field("common_name", common_name)
                .finish(),
        }
    }
}

// === impl RequestParameters ===

impl RequestParameters {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.query_parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_omits_secrets() {
        let oauth = Credentials::OAuth {
            client_id: "c1".to_string(),
            client_secret: "s1".to_string(),
            url: "https://auth".to_string(),
        };
        let basic = Credentials::Basic {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };

        let oauth = format!("{oauth:?}");
        assert!(oauth.contains("c1"));
        assert!(!oauth.contains("s1"));
        assert!(!format!("{basic:?}").contains("hunter2"));
    }
}
