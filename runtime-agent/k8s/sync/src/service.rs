use crate::{
    naming,
    repository::{ApplicationRepository, RepositoryError, SecretRepository},
    resources,
};
use async_trait::async_trait;
use compass_runtime_agent_core::{catalog, ErrorKind};
use compass_runtime_agent_k8s_api::{self as k8s, labels, ApplicationSpec, ResourceExt, Secret};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};
use tracing::{debug, info, warn};

/// The number of times a replace is retried after a conflict.
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// Converges the cluster on a Director catalog.
#[async_trait]
pub trait Synchronize: Send + Sync {
    async fn synchronize(&self, catalog: &catalog::Catalog) -> Result<SyncReport, SyncError>;
}

pub struct Synchronizer<A, S> {
    applications: A,
    secrets: S,
    namespace: String,
}

/// The changes needed to converge the cluster on a catalog.
#[derive(Debug, Default)]
pub struct SyncPlan<'a> {
    pub to_create: Vec<&'a catalog::Application>,
    pub to_update: Vec<(&'a catalog::Application, &'a k8s::Application)>,
    pub to_delete: Vec<&'a k8s::Application>,
}

/// Names of the Applications touched by a synchronization pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Application {0} exists but is not managed by the agent")]
    NotManaged(String),

    #[error("secret {0} exists but is not owned by the application")]
    SecretNotOwned(String),
}

/// A failure to converge a single application.
#[derive(Debug)]
pub struct ApplicationFailure {
    pub application_id: String,
    pub name: String,
    pub operation: Operation,
    pub error: ApplyError,
}

/// Failures of individual applications. The rest of the pass still ran.
#[derive(Debug)]
pub struct SyncErrors {
    pub report: SyncReport,
    pub failures: Vec<ApplicationFailure>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to list applications: {0}")]
    List(#[source] RepositoryError),

    #[error(transparent)]
    Partial(#[from] SyncErrors),
}

/// Matches the catalog against the managed Applications by Director id.
/// Applications whose catalog entry was rejected are left as they are.
pub fn plan<'a>(catalog: &'a catalog::Catalog, current: &'a [k8s::Application]) -> SyncPlan<'a> {
    let mut existing = HashMap::with_capacity(current.len());
    for app in current {
        match app.compass_id() {
            Some(id) if catalog.is_rejected(id) => {
                let application = app.name_any();
                debug!(%application, "Keeping Application with a malformed catalog entry");
            }
            Some(id) => {
                existing.insert(id, app);
            }
            None => {
                debug!(application = %app.name_any(), "Ignoring Application without a Director id");
            }
        }
    }

    let mut plan = SyncPlan::default();
    let mut seen = BTreeSet::new();
    for app in &catalog.applications {
        if !seen.insert(app.id.as_str()) {
            warn!(id = %app.id, "Director returned a duplicate application id");
            continue;
        }
        match existing.remove(app.id.as_str()) {
            Some(current) if current.name_any() == naming::application_name(&app.name) => {
                plan.to_update.push((app, current));
            }
            Some(renamed) => {
                plan.to_delete.push(renamed);
                plan.to_create.push(app);
            }
            None => plan.to_create.push(app),
        }
    }

    let mut stale = existing.into_values().collect::<Vec<_>>();
    stale.sort_by_key(|app| app.name_any());
    plan.to_delete.extend(stale);
    plan
}

// === impl Synchronizer ===

impl<A, S> Synchronizer<A, S>
where
    A: ApplicationRepository,
    S: SecretRepository,
{
    pub fn new(applications: A, secrets: S, namespace: impl Into<String>) -> Self {
        Self {
            applications,
            secrets,
            namespace: namespace.into(),
        }
    }

    async fn create(&self, name: &str, app: &catalog::Application) -> Result<(), ApplyError> {
        if self.applications.get(name).await?.is_some() {
            return Err(ApplyError::NotManaged(name.to_string()));
        }

        let desired = resources::desired(name, &self.namespace, app);
        for secret in &desired.secrets {
            self.apply_secret(name, secret).await?;
        }
        let resource = resources::application(name, &self.namespace, desired.spec);
        self.applications.create(&resource).await?;
        Ok(())
    }

    /// Returns true if anything was written.
    async fn update(
        &self,
        app: &catalog::Application,
        current: &k8s::Application,
    ) -> Result<bool, ApplyError> {
        let name = current.name_any();
        let desired = resources::desired(&name, &self.namespace, app);

        let mut changed = false;
        for secret in &desired.secrets {
            changed |= self.apply_secret(&name, secret).await?;
        }
        changed |= self.replace_spec(current.clone(), &desired.spec).await?;

        let keep = resources::referenced_secrets(&desired.spec).collect::<BTreeSet<_>>();
        changed |= self.remove_secrets(&name, &keep).await?;
        Ok(changed)
    }

    async fn delete(&self, current: &k8s::Application) -> Result<(), ApplyError> {
        let name = current.name_any();
        self.remove_secrets(&name, &BTreeSet::new()).await?;
        self.applications.delete(&name).await?;
        Ok(())
    }

    async fn replace_spec(
        &self,
        mut current: k8s::Application,
        spec: &ApplicationSpec,
    ) -> Result<bool, ApplyError> {
        let name = current.name_any();
        let mut retries = 0;
        loop {
            if current.spec == *spec {
                return Ok(false);
            }

            let mut next = current.clone();
            next.spec = spec.clone();
            next.labels_mut().insert(
                labels::MANAGED_BY.to_string(),
                labels::MANAGED_BY_AGENT.to_string(),
            );

            match self.applications.update(&next).await {
                Ok(_) => return Ok(true),
                Err(error) if error.is_conflict() && retries < MAX_CONFLICT_RETRIES => {
                    retries += 1;
                    debug!(application = %name, retries, "Application changed; retrying");
                    current = self.applications.get(&name).await?.ok_or_else(|| {
                        RepositoryError::NotFound {
                            kind: "Application",
                            name: name.clone(),
                        }
                    })?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Writes `desired` unless an identical secret already exists. A
    /// conflicting replace is retried against the latest version.
    async fn apply_secret(&self, application: &str, desired: &Secret) -> Result<bool, ApplyError> {
        let name = desired.name_any();
        let mut retries = 0;
        loop {
            let Some(existing) = self.secrets.get(&name).await? else {
                self.secrets.create(desired).await?;
                debug!(%application, secret = %name, "Created secret");
                return Ok(true);
            };

            if !labels::is_owned_by(existing.labels(), application) {
                return Err(ApplyError::SecretNotOwned(name));
            }
            if existing.data == desired.data {
                return Ok(false);
            }

            let mut next = existing;
            next.data = desired.data.clone();
            next.string_data = None;
            next.metadata.labels = desired.metadata.labels.clone();
            match self.secrets.update(&next).await {
                Ok(()) => {
                    debug!(%application, secret = %name, "Updated secret");
                    return Ok(true);
                }
                Err(error) if error.is_conflict() && retries < MAX_CONFLICT_RETRIES => {
                    retries += 1;
                    debug!(%application, secret = %name, retries, "Secret changed; retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Deletes the secrets owned by `application` that aren't in `keep`.
    async fn remove_secrets(
        &self,
        application: &str,
        keep: &BTreeSet<&str>,
    ) -> Result<bool, ApplyError> {
        let mut removed = false;
        for name in self.secrets.list_owned(application).await? {
            if keep.contains(name.as_str()) {
                continue;
            }
            self.secrets.delete(&name).await?;
            debug!(%application, secret = %name, "Deleted secret");
            removed = true;
        }
        Ok(removed)
    }
}

#[async_trait]
impl<A, S> Synchronize for Synchronizer<A, S>
where
    A: ApplicationRepository,
    S: SecretRepository,
{
    async fn synchronize(&self, catalog: &catalog::Catalog) -> Result<SyncReport, SyncError> {
        let current = self.applications.list().await.map_err(SyncError::List)?;
        let plan = plan(catalog, &current);
        debug!(
            create = plan.to_create.len(),
            update = plan.to_update.len(),
            delete = plan.to_delete.len(),
            "Synchronizing applications"
        );

        let mut report = SyncReport::default();
        let mut failures = Vec::new();

        // Deletions run first so a renamed application's old resource is
        // gone before its replacement is written.
        for current in plan.to_delete {
            let name = current.name_any();
            match self.delete(current).await {
                Ok(()) => {
                    info!(application = %name, "Deleted Application");
                    report.deleted.push(name);
                }
                Err(error) => {
                    warn!(application = %name, %error, "Failed to delete Application");
                    failures.push(ApplicationFailure {
                        application_id: current.compass_id().unwrap_or_default().to_string(),
                        name,
                        operation: Operation::Delete,
                        error,
                    });
                }
            }
        }

        for app in plan.to_create {
            let name = naming::application_name(&app.name);
            match self.create(&name, app).await {
                Ok(()) => {
                    info!(application = %name, id = %app.id, "Created Application");
                    report.created.push(name);
                }
                Err(error) => {
                    warn!(application = %name, id = %app.id, %error, "Failed to create");
                    failures.push(ApplicationFailure {
                        application_id: app.id.clone(),
                        name,
                        operation: Operation::Create,
                        error,
                    });
                }
            }
        }

        for (app, current) in plan.to_update {
            let name = current.name_any();
            match self.update(app, current).await {
                Ok(true) => {
                    info!(application = %name, id = %app.id, "Updated Application");
                    report.updated.push(name);
                }
                Ok(false) => report.unchanged.push(name),
                Err(error) => {
                    warn!(application = %name, id = %app.id, %error, "Failed to update");
                    failures.push(ApplicationFailure {
                        application_id: app.id.clone(),
                        name,
                        operation: Operation::Update,
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(SyncErrors { report, failures }.into())
        }
    }
}

// === impl SyncReport ===

impl SyncReport {
    /// True if the pass wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

// === impl ApplyError ===

impl ApplyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Repository(error) => error.kind(),
            Self::NotManaged(_) | Self::SecretNotOwned(_) => ErrorKind::WrongInput,
        }
    }
}

// === impl SyncErrors ===

impl SyncErrors {
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.application_id.as_str())
    }
}

impl fmt::Display for SyncErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to synchronize {} application(s)", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncErrors {}

impl fmt::Display for ApplicationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}): {}",
            self.operation, self.name, self.application_id, self.error
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

// === impl SyncError ===

impl SyncError {
    /// Partial failures are retryable unless every one of them was caused by
    /// bad input.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::List(error) => error.kind(),
            Self::Partial(errors) => {
                if errors
                    .failures
                    .iter()
                    .all(|f| f.error.kind() == ErrorKind::WrongInput)
                {
                    ErrorKind::WrongInput
                } else {
                    ErrorKind::Upstream
                }
            }
        }
    }
}
