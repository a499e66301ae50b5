use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Marks resources written by the agent.
pub const MANAGED_BY: &str = "compass.kyma-project.io/managed-by";
pub const MANAGED_BY_AGENT: &str = "compass-runtime-agent";

/// Names the Application that owns a secret.
pub const APPLICATION: &str = "compass.kyma-project.io/application";

/// Names the service a secret belongs to.
pub const SERVICE_ID: &str = "compass.kyma-project.io/service-id";

/// A label selector matching every resource written by the agent.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY}={MANAGED_BY_AGENT}")
}

pub fn managed() -> Map {
    std::iter::once((MANAGED_BY.to_string(), MANAGED_BY_AGENT.to_string())).collect()
}

/// Labels for a secret exclusively owned by one service of an Application.
pub fn owned_by(application: &str, service_id: &str) -> Map {
    let mut labels = managed();
    labels.insert(APPLICATION.to_string(), application.to_string());
    labels.insert(SERVICE_ID.to_string(), service_id.to_string());
    labels
}

/// True if `labels` mark a resource owned by `application`.
pub fn is_owned_by(labels: &Map, application: &str) -> bool {
    labels.get(MANAGED_BY).map(String::as_str) == Some(MANAGED_BY_AGENT)
        && labels.get(APPLICATION).map(String::as_str) == Some(application)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_requires_both_labels() {
        let labels = owned_by("billing", "svc-1");
        assert!(is_owned_by(&labels, "billing"));
        assert!(!is_owned_by(&labels, "crm"));

        let mut foreign = labels.clone();
        foreign.remove(MANAGED_BY);
        assert!(!is_owned_by(&foreign, "billing"));
    }
}
