//! Drives the runtime's connection to Compass: obtains and renews the client
//! certificate, then periodically synchronizes Applications from the
//! Director, recording every outcome on the CompassConnection resource.

use crate::{
    config::{ConfigError, ConfigProvider},
    driver::{Reconcile, Requeue},
    k8s::{
        compass_connection::{CertificateStatus, ManagementInfo},
        CompassConnection, CompassConnectionSpec, CompassConnectionStatus, ConnectionState,
    },
    metrics::ConnectionMetrics,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compass_runtime_agent_core::{
    catalog::Rejected, CertificateError, CertificateManager, ClientCredentials, ConnectorClient,
    ConnectorError, CredentialStore, DirectorClient, DirectorError, ErrorKind, RenewalError,
    RuntimeTarget, StoreError,
};
use compass_runtime_agent_k8s_sync::{RepositoryError, SyncError, SyncReport, Synchronize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

mod repository;
#[cfg(test)]
mod tests;

pub use self::repository::{ConnectionRepository, InMemoryConnections, KubeConnections};

/// Longest error message recorded in the status.
pub const MAX_STATUS_MESSAGE_LEN: usize = 1024;

/// The most Compass requests a single reconcile makes: the token exchange
/// and a certificate request, or a renewal, then the catalog fetch and one
/// request per runtime label.
const COMPASS_REQUESTS_PER_RECONCILE: u32 = 5;

/// Headroom for the Kubernetes API calls of a reconcile.
const KUBE_ALLOWANCE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct Settings {
    /// The minimum time between two Director synchronizations.
    pub minimal_sync_time: Duration,

    /// How long to wait between reconciles.
    pub sync_period: Duration,

    /// Labels published on the runtime after each successful synchronization.
    pub runtime_labels: BTreeMap<String, String>,
}

/// The services the supervisor depends on.
pub struct Collaborators {
    pub connections: Arc<dyn ConnectionRepository>,
    pub credentials: Arc<dyn CredentialStore>,
    pub config: Arc<dyn ConfigProvider>,
    pub connector: Arc<dyn ConnectorClient>,
    pub director: Arc<dyn DirectorClient>,
    pub synchronizer: Arc<dyn Synchronize>,
}

pub struct ConnectionSupervisor {
    connections: Arc<dyn ConnectionRepository>,
    credentials: Arc<dyn CredentialStore>,
    config: Arc<dyn ConfigProvider>,
    certificates: CertificateManager<Arc<dyn ConnectorClient>>,
    director: Arc<dyn DirectorClient>,
    synchronizer: Arc<dyn Synchronize>,
    settings: Settings,
    metrics: ConnectionMetrics,
}

/// Failures that prevent the status from being recorded at all.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to read CompassConnection: {0}")]
    Read(#[source] RepositoryError),

    #[error("failed to write CompassConnection: {0}")]
    Write(#[source] RepositoryError),
}

/// Recorded as `lastConnectionStatus`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load credentials: {0}")]
    Load(#[source] StoreError),

    #[error("failed to store credentials: {0}")]
    Store(#[source] StoreError),

    #[error("failed to establish connection with the Connector: {0}")]
    Establish(#[source] ConnectorError),

    #[error("failed to obtain client certificate: {0}")]
    Certificate(#[from] RenewalError),

    #[error("stored client certificate is invalid: {0}")]
    InvalidCertificate(#[from] CertificateError),
}

/// Recorded as `lastSyncStatus`.
#[derive(Debug, thiserror::Error)]
pub enum SynchronizationError {
    #[error("failed to fetch applications from the Director: {0}")]
    Director(#[source] DirectorError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("failed to set runtime labels: {0}")]
    Labels(#[source] DirectorError),

    #[error(
        "skipped {} malformed application(s) from the Director: {}",
        .rejected.len(),
        join(.rejected)
    )]
    Rejected {
        report: SyncReport,
        rejected: Vec<Rejected>,
    },
}

/// A working client identity and where to use it.
struct Connected {
    credentials: ClientCredentials,
    target: RuntimeTarget,

    /// Set when a certificate was issued during this reconcile.
    issued: bool,
}

// === impl ConnectionSupervisor ===

impl ConnectionSupervisor {
    pub fn new(
        collaborators: Collaborators,
        renewal_threshold: f64,
        settings: Settings,
        metrics: ConnectionMetrics,
    ) -> Self {
        let Collaborators {
            connections,
            credentials,
            config,
            connector,
            director,
            synchronizer,
        } = collaborators;
        Self {
            connections,
            credentials,
            config,
            certificates: CertificateManager::new(connector, renewal_threshold),
            director,
            synchronizer,
            settings,
            metrics,
        }
    }

    /// Runs one pass of the state machine as of `now`.
    pub async fn reconcile_at(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Requeue, ReconcileError> {
        let connection = self.get_or_create(name).await?;
        let previous = connection.state();
        let mut stored = connection.spec.clone();
        let mut spec = connection.spec.clone();
        let mut status = connection.status.clone().unwrap_or_default();

        let connected = match self.connect(&mut spec, &mut status, now).await {
            Ok(connected) => connected,
            Err(error) => {
                warn!(%error, "Failed to connect to Compass");
                status.state = Some(ConnectionState::ConnectionFailed);
                status.last_connection_status = Some(truncate(&error.to_string()));
                return self.persist(name, &mut stored, &spec, &status).await;
            }
        };
        status.state = Some(ConnectionState::Connected);
        status.last_connection_status = None;

        if connected.issued {
            // The one-time token is spent once a certificate is issued, so the
            // endpoints must be recorded before a Director call can stall.
            self.write(name, &mut stored, &spec, &status).await?;
        }

        if !spec.resync_now && !self.sync_due(status.last_sync, now) {
            debug!("Skipping synchronization");
            // The last synchronization result remains the current one.
            if let Some(
                state @ (ConnectionState::Synchronized | ConnectionState::SynchronizationFailed),
            ) = previous
            {
                status.state = Some(state);
            }
            return self.persist(name, &mut stored, &spec, &status).await;
        }

        spec.resync_now = false;
        advance(&mut status.last_sync, now);
        match self.synchronize(&connected).await {
            Ok(report) => {
                info!(
                    created = report.created.len(),
                    updated = report.updated.len(),
                    deleted = report.deleted.len(),
                    "Synchronized applications"
                );
                self.metrics.synchronized(&report);
                status.state = Some(ConnectionState::Synchronized);
                status.last_sync_status = None;
                advance(&mut status.last_sync_success, now);
            }
            Err(error) => {
                warn!(%error, "Failed to synchronize applications");
                match &error {
                    SynchronizationError::Sync(SyncError::Partial(errors)) => {
                        self.metrics.synchronized(&errors.report)
                    }
                    SynchronizationError::Rejected { report, .. } => {
                        self.metrics.synchronized(report)
                    }
                    _ => {}
                }
                status.state = Some(ConnectionState::SynchronizationFailed);
                status.last_sync_status = Some(truncate(&error.to_string()));
            }
        }

        self.persist(name, &mut stored, &spec, &status).await
    }

    async fn get_or_create(&self, name: &str) -> Result<CompassConnection, ReconcileError> {
        if let Some(connection) = self
            .connections
            .get(name)
            .await
            .map_err(ReconcileError::Read)?
        {
            return Ok(connection);
        }

        info!(%name, "Creating CompassConnection");
        let connection = CompassConnection::new(name, CompassConnectionSpec::default());
        match self.connections.create(&connection).await {
            Ok(created) => Ok(created),
            Err(RepositoryError::AlreadyExists { .. }) => self
                .connections
                .get(name)
                .await
                .map_err(ReconcileError::Read)?
                .ok_or_else(|| {
                    ReconcileError::Read(RepositoryError::NotFound {
                        kind: "CompassConnection",
                        name: name.to_string(),
                    })
                }),
            Err(error) => Err(ReconcileError::Write(error)),
        }
    }

    /// Ensures a usable client certificate, establishing the connection if
    /// no credentials or endpoints are known and renewing when due.
    async fn connect(
        &self,
        spec: &mut CompassConnectionSpec,
        status: &mut CompassConnectionStatus,
        now: DateTime<Utc>,
    ) -> Result<Connected, ConnectError> {
        let config = self.config.get().await?;
        let stored = self.credentials.get().await.map_err(ConnectError::Load)?;

        let mut issued = true;
        let (credentials, management) = match (stored, spec.management_info.clone()) {
            (Some(current), Some(management)) => {
                let due = self.certificates.should_renew(&current, now)?;
                let requested = std::mem::take(&mut spec.refresh_credentials_now);
                if due || requested {
                    info!(requested, "Renewing client certificate");
                    let renewed = self.certificate_issued(
                        self.certificates
                            .renew(&current, &management.certificates_url)
                            .await,
                    )?;
                    self.credentials
                        .put(&renewed)
                        .await
                        .map_err(ConnectError::Store)?;
                    advance(&mut status.renewed, now);
                    (renewed, management)
                } else {
                    issued = false;
                    (current, management)
                }
            }
            _ => {
                info!(connector = %config.connector_url, "Establishing connection with Compass");
                let info = self
                    .certificates
                    .connector()
                    .establish_connection(&config.connector_url, &config.token)
                    .await
                    .map_err(ConnectError::Establish)?;
                let credentials =
                    self.certificate_issued(self.certificates.establish(&info).await)?;
                self.credentials
                    .put(&credentials)
                    .await
                    .map_err(ConnectError::Store)?;

                let management = ManagementInfo {
                    connector_url: config.connector_url.clone(),
                    director_url: info.director_url,
                    certificates_url: info.certificates_url,
                };
                spec.management_info = Some(management.clone());
                spec.refresh_credentials_now = false;
                advance(&mut status.established, now);
                (credentials, management)
            }
        };

        let certificate = credentials.certificate()?;
        status.certificate = Some(CertificateStatus {
            not_before: certificate.not_before,
            not_after: certificate.not_after,
        });

        Ok(Connected {
            credentials,
            target: RuntimeTarget {
                director_url: management.director_url,
                tenant: config.tenant,
                runtime_id: config.runtime_id,
            },
            issued,
        })
    }

    fn certificate_issued(
        &self,
        result: Result<ClientCredentials, RenewalError>,
    ) -> Result<ClientCredentials, ConnectError> {
        self.metrics.certificate_requested(result.is_ok());
        Ok(result?)
    }

    /// Limits how often the Director is queried, whatever the outcome of
    /// earlier attempts.
    fn sync_due(&self, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_sync else {
            return true;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed >= self.settings.minimal_sync_time,
            // The clock went backwards.
            Err(_) => true,
        }
    }

    async fn synchronize(&self, connected: &Connected) -> Result<SyncReport, SynchronizationError> {
        let catalog = self
            .director
            .fetch_catalog(&connected.credentials, &connected.target)
            .await
            .map_err(SynchronizationError::Director)?;
        debug!(
            applications = catalog.len(),
            rejected = catalog.rejected.len(),
            "Fetched applications"
        );

        let report = self.synchronizer.synchronize(&catalog).await?;

        if !self.settings.runtime_labels.is_empty() {
            self.director
                .set_runtime_labels(
                    &connected.credentials,
                    &connected.target,
                    &self.settings.runtime_labels,
                )
                .await
                .map_err(SynchronizationError::Labels)?;
        }

        if !catalog.rejected.is_empty() {
            return Err(SynchronizationError::Rejected {
                report,
                rejected: catalog.rejected,
            });
        }
        Ok(report)
    }

    /// Records the final outcome of a reconcile.
    async fn persist(
        &self,
        name: &str,
        stored: &mut CompassConnectionSpec,
        spec: &CompassConnectionSpec,
        status: &CompassConnectionStatus,
    ) -> Result<Requeue, ReconcileError> {
        self.write(name, stored, spec, status).await?;
        if let Some(state) = status.state {
            self.metrics.reconciled(state);
        }
        Ok(Requeue::After(self.settings.sync_period))
    }

    /// Writes the spec, if it differs from `stored`, and then the status.
    async fn write(
        &self,
        name: &str,
        stored: &mut CompassConnectionSpec,
        spec: &CompassConnectionSpec,
        status: &CompassConnectionStatus,
    ) -> Result<(), ReconcileError> {
        if spec != stored {
            self.connections
                .update_spec(name, spec)
                .await
                .map_err(ReconcileError::Write)?;
            *stored = spec.clone();
        }
        self.connections
            .update_status(name, status)
            .await
            .map_err(ReconcileError::Write)
    }
}

#[async_trait]
impl Reconcile for ConnectionSupervisor {
    type Error = ReconcileError;

    async fn reconcile(&self, name: &str) -> Result<Requeue, ReconcileError> {
        let result = self.reconcile_at(name, Utc::now()).await;
        if result.is_err() {
            self.metrics.reconcile_failed();
        }
        result
    }
}

// === impl ReconcileError ===

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Read(error) | Self::Write(error) => error.kind(),
        }
    }
}

/// Bounds a whole reconcile. Each Compass request has its own
/// `request_timeout`, so a failing request is still recorded before the
/// reconcile is abandoned.
pub fn reconcile_timeout(request_timeout: Duration) -> Duration {
    request_timeout * COMPASS_REQUESTS_PER_RECONCILE + KUBE_ALLOWANCE
}

/// Moves `field` to `now`, never backwards.
fn advance(field: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if field.map_or(true, |t| t < now) {
        *field = Some(now);
    }
}

fn join(rejected: &[Rejected]) -> String {
    rejected
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_STATUS_MESSAGE_LEN) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}
