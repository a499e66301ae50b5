//! Access to the Application and Secret resources in the applications
//! namespace.

use async_trait::async_trait;
use compass_runtime_agent_core::ErrorKind;
use compass_runtime_agent_k8s_api::{
    self as k8s, is_conflict, is_not_found, labels, Api, Client, DeleteParams, ListParams,
    PostParams, ResourceExt, Secret,
};

const FIELD_MANAGER: &str = "compass-runtime-agent";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The object changed since it was read.
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error(transparent)]
    Kube(#[from] k8s::Error),

    #[error("{0}")]
    Rejected(String),
}

/// Applications labeled as managed by the agent.
#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<k8s::Application>, RepositoryError>;

    async fn get(&self, name: &str) -> Result<Option<k8s::Application>, RepositoryError>;

    async fn create(&self, app: &k8s::Application) -> Result<k8s::Application, RepositoryError>;

    /// Replaces the object, failing with [`RepositoryError::Conflict`] if its
    /// resource version is stale.
    async fn update(&self, app: &k8s::Application) -> Result<k8s::Application, RepositoryError>;

    /// Deleting an object that's already gone is not an error.
    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SecretRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Secret>, RepositoryError>;

    /// Names of the secrets labeled as owned by `application`.
    async fn list_owned(&self, application: &str) -> Result<Vec<String>, RepositoryError>;

    async fn create(&self, secret: &Secret) -> Result<(), RepositoryError>;

    async fn update(&self, secret: &Secret) -> Result<(), RepositoryError>;

    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;
}

#[derive(Clone)]
pub struct KubeApplications {
    api: Api<k8s::Application>,
}

#[derive(Clone)]
pub struct KubeSecrets {
    api: Api<Secret>,
}

// === impl RepositoryError ===

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::AlreadyExists { .. } | Self::Rejected(_) => ErrorKind::WrongInput,
            Self::NotFound { .. } | Self::Kube(_) => ErrorKind::Upstream,
        }
    }

    fn from_write(error: k8s::Error, kind: &'static str, name: &str, creating: bool) -> Self {
        if is_conflict(&error) {
            let name = name.to_string();
            return if creating {
                Self::AlreadyExists { kind, name }
            } else {
                Self::Conflict { kind, name }
            };
        }
        if is_not_found(&error) {
            return Self::NotFound {
                kind,
                name: name.to_string(),
            };
        }
        Self::Kube(error)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

// === impl KubeApplications ===

impl KubeApplications {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ApplicationRepository for KubeApplications {
    async fn list(&self) -> Result<Vec<k8s::Application>, RepositoryError> {
        let params = ListParams::default().labels(&labels::managed_selector());
        Ok(self.api.list(&params).await?.items)
    }

    async fn get(&self, name: &str) -> Result<Option<k8s::Application>, RepositoryError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, app: &k8s::Application) -> Result<k8s::Application, RepositoryError> {
        self.api
            .create(&post_params(), app)
            .await
            .map_err(|e| RepositoryError::from_write(e, "Application", &app.name_any(), true))
    }

    async fn update(&self, app: &k8s::Application) -> Result<k8s::Application, RepositoryError> {
        let name = app.name_any();
        self.api
            .replace(&name, &post_params(), app)
            .await
            .map_err(|e| RepositoryError::from_write(e, "Application", &name, false))
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

// === impl KubeSecrets ===

impl KubeSecrets {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretRepository for KubeSecrets {
    async fn get(&self, name: &str) -> Result<Option<Secret>, RepositoryError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list_owned(&self, application: &str) -> Result<Vec<String>, RepositoryError> {
        let selector = format!(
            "{},{}={application}",
            labels::managed_selector(),
            labels::APPLICATION
        );
        let secrets = self
            .api
            .list_metadata(&ListParams::default().labels(&selector))
            .await?;
        Ok(secrets.items.iter().map(|s| s.name_any()).collect())
    }

    async fn create(&self, secret: &Secret) -> Result<(), RepositoryError> {
        self.api
            .create(&post_params(), secret)
            .await
            .map_err(|e| RepositoryError::from_write(e, "Secret", &secret.name_any(), true))?;
        Ok(())
    }

    async fn update(&self, secret: &Secret) -> Result<(), RepositoryError> {
        let name = secret.name_any();
        self.api
            .replace(&name, &post_params(), secret)
            .await
            .map_err(|e| RepositoryError::from_write(e, "Secret", &name, false))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
