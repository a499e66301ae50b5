use super::*;
use crate::{
    config::{AgentConfiguration, StaticConfigProvider},
    driver::Driver,
    k8s::compass_connection::NAME,
};
use chrono::TimeZone;
use compass_runtime_agent_core::{
    catalog::{self, Catalog},
    connector::{CertificateChain, ConnectionInfo, ErrorCode},
    InMemoryCredentialStore,
};
use compass_runtime_agent_k8s_sync::{
    memory::{InMemoryApplications, InMemorySecrets},
    Synchronizer,
};
use futures::prelude::*;
use maplit::btreemap;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, Issuer,
    KeyPair,
};
use tokio::{sync::oneshot, time};

const NAMESPACE: &str = "kyma-integration";

/// Signs every CSR with a throwaway CA.
#[derive(Clone, Default)]
struct TestConnector {
    state: Arc<Mutex<ConnectorState>>,
}

#[derive(Default)]
struct ConnectorState {
    fail: bool,
    tokens: Vec<String>,

    /// URL of each certificate request and whether it carried an identity.
    requests: Vec<(String, bool)>,
}

#[derive(Clone, Default)]
struct TestDirector {
    state: Arc<Mutex<DirectorState>>,
}

#[derive(Default)]
struct DirectorState {
    catalog: Vec<catalog::Application>,
    rejected: Vec<catalog::Rejected>,
    error: Option<String>,

    /// How long each catalog fetch takes.
    delay: Option<Duration>,
    fetches: usize,
    certificates: Vec<String>,
    labels: Vec<BTreeMap<String, String>>,
}

struct Harness {
    supervisor: ConnectionSupervisor,
    connections: InMemoryConnections,
    credentials: InMemoryCredentialStore,
    connector: TestConnector,
    director: TestDirector,
    apps: InMemoryApplications,
}

fn harness() -> Harness {
    harness_with_labels(BTreeMap::new())
}

fn harness_with_labels(runtime_labels: BTreeMap<String, String>) -> Harness {
    let connections = InMemoryConnections::default();
    let credentials = InMemoryCredentialStore::default();
    let connector = TestConnector::default();
    let director = TestDirector::default();
    let apps = InMemoryApplications::default();

    let supervisor = ConnectionSupervisor::new(
        Collaborators {
            connections: Arc::new(connections.clone()),
            credentials: Arc::new(credentials.clone()),
            config: Arc::new(StaticConfigProvider(AgentConfiguration {
                connector_url: "https://connector.example.com/graphql".to_string(),
                token: "one-time-token".to_string(),
                runtime_id: "rt-1".to_string(),
                tenant: "tenant-1".to_string(),
            })),
            connector: Arc::new(connector.clone()),
            director: Arc::new(director.clone()),
            synchronizer: Arc::new(Synchronizer::new(
                apps.clone(),
                InMemorySecrets::default(),
                NAMESPACE,
            )),
        },
        0.3,
        Settings {
            minimal_sync_time: Duration::from_secs(15),
            sync_period: Duration::from_secs(20),
            runtime_labels,
        },
        ConnectionMetrics::default(),
    );

    Harness {
        supervisor,
        connections,
        credentials,
        connector,
        director,
        apps,
    }
}

/// Seconds after the start of the certificates' validity.
fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn billing() -> catalog::Application {
    catalog::Application {
        id: "app-1".to_string(),
        name: "billing".to_string(),
        services: vec![catalog::Service {
            id: "svc-1".to_string(),
            name: "invoices".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

impl Harness {
    async fn reconcile(&self, now: DateTime<Utc>) -> CompassConnectionStatus {
        let requeue = self.supervisor.reconcile_at(NAME, now).await.unwrap();
        assert_eq!(requeue, Requeue::After(Duration::from_secs(20)));
        self.connections.status()
    }

    fn spec(&self) -> CompassConnectionSpec {
        self.connections.current().unwrap().spec
    }
}

#[tokio::test]
async fn first_boot_establishes_and_synchronizes() {
    let h = harness();
    h.director.state.lock().catalog = vec![billing()];

    let status = h.reconcile(at(0)).await;

    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(status.established, Some(at(0)));
    assert_eq!(status.last_sync, Some(at(0)));
    assert_eq!(status.last_sync_success, Some(at(0)));
    assert_eq!(status.renewed, None);
    assert_eq!(status.last_connection_status, None);
    assert_eq!(
        status.certificate,
        Some(CertificateStatus {
            not_before: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap(),
        })
    );

    assert_eq!(
        h.spec().management_info,
        Some(ManagementInfo {
            connector_url: "https://connector.example.com/graphql".to_string(),
            director_url: "https://director.example.com/graphql".to_string(),
            certificates_url: "https://connector.example.com/v1/certificates".to_string(),
        })
    );
    assert_eq!(h.connector.state.lock().tokens, vec!["one-time-token".to_string()]);
    assert_eq!(
        h.connector.state.lock().requests,
        vec![("https://connector.example.com/v1/csr?token=abc".to_string(), false)]
    );

    let stored = h.credentials.snapshot().expect("credentials must be stored");
    assert_eq!(
        h.director.state.lock().certificates,
        vec![stored.certificate_pem]
    );
    assert_eq!(h.apps.names(), vec!["billing"]);
}

#[tokio::test]
async fn connection_failure_is_recorded_then_recovers() {
    let h = harness();
    h.connector.state.lock().fail = true;

    let status = h.reconcile(at(0)).await;
    assert_eq!(status.state, Some(ConnectionState::ConnectionFailed));
    assert!(status
        .last_connection_status
        .as_deref()
        .unwrap()
        .contains("CodeInternal"));
    assert_eq!(status.established, None);
    assert_eq!(h.spec().management_info, None);
    assert_eq!(h.director.state.lock().fetches, 0);
    assert!(h.credentials.snapshot().is_none());

    h.connector.state.lock().fail = false;
    let status = h.reconcile(at(5)).await;
    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(status.last_connection_status, None);
    assert_eq!(status.established, Some(at(5)));
    assert_eq!(h.director.state.lock().fetches, 1);
}

#[tokio::test]
async fn director_failure_is_recorded() {
    let h = harness();
    h.director.state.lock().error = Some("connection refused".to_string());

    let status = h.reconcile(at(0)).await;

    assert_eq!(status.state, Some(ConnectionState::SynchronizationFailed));
    assert_eq!(
        status.last_sync_status.as_deref(),
        Some(concat!(
            "failed to fetch applications from the Director: ",
            "director request failed: connection refused"
        ))
    );
    assert_eq!(status.last_sync, Some(at(0)));
    assert_eq!(status.last_sync_success, None);
    assert_eq!(status.established, Some(at(0)));

    h.director.state.lock().error = None;
    let status = h.reconcile(at(30)).await;
    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(status.last_sync_status, None);
    assert_eq!(status.last_sync_success, Some(at(30)));
}

#[tokio::test]
async fn synchronization_is_rate_limited() {
    let h = harness();
    h.reconcile(at(0)).await;
    assert_eq!(h.director.state.lock().fetches, 1);

    let status = h.reconcile(at(10)).await;
    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(status.last_sync, Some(at(0)));
    assert_eq!(h.director.state.lock().fetches, 1);

    let status = h.reconcile(at(15)).await;
    assert_eq!(status.last_sync, Some(at(15)));
    assert_eq!(h.director.state.lock().fetches, 2);
}

#[tokio::test]
async fn skipped_synchronization_keeps_last_failure() {
    let h = harness();
    h.director.state.lock().error = Some("timeout".to_string());
    h.reconcile(at(0)).await;

    let status = h.reconcile(at(1)).await;
    assert_eq!(status.state, Some(ConnectionState::SynchronizationFailed));
    assert_eq!(h.director.state.lock().fetches, 1);
}

#[tokio::test]
async fn resync_now_overrides_rate_limit() {
    let h = harness();
    h.reconcile(at(0)).await;
    h.connections.edit_spec(|spec| spec.resync_now = true);

    let status = h.reconcile(at(1)).await;

    assert_eq!(status.last_sync, Some(at(1)));
    assert_eq!(h.director.state.lock().fetches, 2);
    assert!(!h.spec().resync_now);
}

#[tokio::test]
async fn renews_when_due() {
    let h = harness();
    h.reconcile(at(0)).await;
    let established = h.credentials.snapshot().unwrap();

    let status = h.reconcile(at(60)).await;
    assert_eq!(status.renewed, None);
    assert_eq!(h.connector.state.lock().requests.len(), 1);

    // 45 days into a 100 day certificate.
    let later = at(45 * 24 * 60 * 60);
    let status = h.reconcile(later).await;

    assert_eq!(status.renewed, Some(later));
    assert_eq!(status.established, Some(at(0)));
    assert_eq!(
        h.connector.state.lock().requests.last().cloned(),
        Some((
            "https://connector.example.com/v1/certificates/renewals".to_string(),
            true
        ))
    );

    let renewed = h.credentials.snapshot().unwrap();
    assert_ne!(renewed.key_pem, established.key_pem);
    assert_eq!(
        h.director.state.lock().certificates.last(),
        Some(&renewed.certificate_pem)
    );
}

#[tokio::test]
async fn refresh_credentials_now_forces_renewal() {
    let h = harness();
    h.reconcile(at(0)).await;
    h.connections
        .edit_spec(|spec| spec.refresh_credentials_now = true);

    let status = h.reconcile(at(1)).await;

    assert_eq!(status.renewed, Some(at(1)));
    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(h.connector.state.lock().requests.len(), 2);
    assert!(!h.spec().refresh_credentials_now);
}

#[tokio::test]
async fn failed_renewal_resets_refresh_request() {
    let h = harness();
    h.reconcile(at(0)).await;
    h.connections
        .edit_spec(|spec| spec.refresh_credentials_now = true);
    h.connector.state.lock().fail = true;

    let status = h.reconcile(at(1)).await;

    assert_eq!(status.state, Some(ConnectionState::ConnectionFailed));
    assert!(!status.last_connection_status.unwrap_or_default().is_empty());
    assert_eq!(status.renewed, None);
    assert!(!h.spec().refresh_credentials_now);
}

#[tokio::test]
async fn renewal_recovers_without_bypassing_rate_limit() {
    let h = harness();
    h.reconcile(at(0)).await;
    h.connector.state.lock().fail = true;
    h.connections
        .edit_spec(|spec| spec.refresh_credentials_now = true);
    let status = h.reconcile(at(1)).await;
    assert_eq!(status.state, Some(ConnectionState::ConnectionFailed));

    h.connector.state.lock().fail = false;
    h.connections
        .edit_spec(|spec| spec.refresh_credentials_now = true);
    let status = h.reconcile(at(2)).await;

    assert_eq!(status.state, Some(ConnectionState::Connected));
    assert_eq!(status.last_connection_status, None);
    assert_eq!(status.renewed, Some(at(2)));
    assert_eq!(status.last_sync, Some(at(0)));
    assert_eq!(h.director.state.lock().fetches, 1);

    let status = h.reconcile(at(15)).await;
    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(h.director.state.lock().fetches, 2);
}

#[tokio::test]
async fn rejected_applications_are_reported() {
    let h = harness();
    {
        let mut director = h.director.state.lock();
        director.catalog = vec![billing()];
        director.rejected = vec![catalog::Rejected {
            id: "app-2".to_string(),
            reason: "service \"svc\" has an entry of unknown type \"SOAP\"".to_string(),
        }];
    }

    let status = h.reconcile(at(0)).await;

    assert_eq!(status.state, Some(ConnectionState::SynchronizationFailed));
    assert_eq!(
        status.last_sync_status.as_deref(),
        Some(concat!(
            "skipped 1 malformed application(s) from the Director: ",
            "app-2: service \"svc\" has an entry of unknown type \"SOAP\""
        ))
    );
    assert_eq!(h.apps.names(), vec!["billing"]);
}

#[tokio::test(start_paused = true)]
async fn interrupted_first_sync_keeps_endpoints() {
    let h = harness();
    h.director.state.lock().delay = Some(Duration::from_secs(3600));

    let interrupted =
        time::timeout(Duration::from_secs(60), h.supervisor.reconcile_at(NAME, at(0))).await;
    assert!(interrupted.is_err());

    let status = h.connections.status();
    assert_eq!(status.state, Some(ConnectionState::Connected));
    assert_eq!(status.established, Some(at(0)));
    assert!(h.spec().management_info.is_some());

    h.director.state.lock().delay = None;
    let status = h.reconcile(at(20)).await;

    assert_eq!(status.state, Some(ConnectionState::Synchronized));
    assert_eq!(h.connector.state.lock().tokens.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_director_failure_is_recorded() {
    let Harness {
        supervisor,
        connections,
        director,
        ..
    } = harness();
    {
        let mut state = director.state.lock();
        state.delay = Some(Duration::from_secs(30));
        state.error = Some("context deadline exceeded".to_string());
    }

    let driver = Driver::new(
        NAME,
        supervisor,
        reconcile_timeout(Duration::from_secs(30)),
        Duration::from_secs(20),
    );
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(driver.run(stream::pending(), stopped.map(|_| ())));

    time::sleep(Duration::from_secs(45)).await;

    let status = connections.status();
    assert_eq!(status.state, Some(ConnectionState::SynchronizationFailed));
    assert!(status
        .last_sync_status
        .unwrap_or_default()
        .contains("context deadline exceeded"));
    assert!(connections
        .current()
        .and_then(|c| c.spec.management_info)
        .is_some());

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn timestamps_never_move_backwards() {
    let h = harness();
    h.reconcile(at(100)).await;

    // The clock stepped back; synchronization still runs.
    let status = h.reconcile(at(50)).await;

    assert_eq!(h.director.state.lock().fetches, 2);
    assert_eq!(status.last_sync, Some(at(100)));
    assert_eq!(status.last_sync_success, Some(at(100)));
    assert_eq!(status.established, Some(at(100)));
}

#[tokio::test]
async fn long_errors_are_truncated() {
    let h = harness();
    h.director.state.lock().error = Some("x".repeat(5000));

    let status = h.reconcile(at(0)).await;

    let message = status.last_sync_status.unwrap();
    assert_eq!(message.chars().count(), MAX_STATUS_MESSAGE_LEN);
    assert!(message.starts_with("failed to fetch applications"));
}

#[tokio::test]
async fn publishes_runtime_labels_after_synchronization() {
    let labels = btreemap! {
        "runtime_eventServiceUrl".to_string() => "https://gateway.example.com".to_string(),
    };
    let h = harness_with_labels(labels.clone());

    h.reconcile(at(0)).await;

    assert_eq!(h.director.state.lock().labels, vec![labels]);
}

#[tokio::test]
async fn write_failures_are_returned() {
    let h = harness();
    h.reconcile(at(0)).await;
    h.connections.fail_writes(true);

    let error = h.supervisor.reconcile_at(NAME, at(30)).await.unwrap_err();

    assert!(matches!(error, ReconcileError::Write(_)));
    // The first boot recorded the new endpoints, then the outcome.
    assert_eq!(h.connections.status_writes(), 2);
}

#[test]
fn truncates_on_char_boundaries() {
    let message = "é".repeat(MAX_STATUS_MESSAGE_LEN + 1);
    assert_eq!(truncate(&message).chars().count(), MAX_STATUS_MESSAGE_LEN);
    assert_eq!(truncate("short"), "short");
}

// === impl TestConnector ===

#[async_trait]
impl ConnectorClient for TestConnector {
    async fn establish_connection(
        &self,
        _: &str,
        token: &str,
    ) -> Result<ConnectionInfo, ConnectorError> {
        let mut state = self.state.lock();
        state.tokens.push(token.to_string());
        if state.fail {
            return Err(unavailable());
        }
        Ok(ConnectionInfo {
            csr_url: "https://connector.example.com/v1/csr?token=abc".to_string(),
            director_url: "https://director.example.com/graphql".to_string(),
            certificates_url: "https://connector.example.com/v1/certificates".to_string(),
            subject: "O=Org,OU=OrgUnit,C=DE,CN=rt-1".to_string(),
            key_algorithm: "rsa2048".to_string(),
        })
    }

    async fn request_certificate(
        &self,
        csr_der: &[u8],
        url: &str,
        identity: Option<&ClientCredentials>,
    ) -> Result<CertificateChain, ConnectorError> {
        {
            let mut state = self.state.lock();
            state.requests.push((url.to_string(), identity.is_some()));
            if state.fail {
                return Err(unavailable());
            }
        }

        let ca_key = KeyPair::generate().unwrap();
        let mut ca = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca.distinguished_name.push(DnType::CommonName, "compass-ca");
        let ca_pem = ca.self_signed(&ca_key).unwrap().pem();
        let issuer = Issuer::from_ca_cert_pem(&ca_pem, ca_key).unwrap();

        let csr_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE REQUEST", csr_der.to_vec()));
        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem).unwrap();
        csr.params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        csr.params.not_after = rcgen::date_time_ymd(2024, 4, 10);
        let certificate = csr.signed_by(&issuer).unwrap();

        Ok(CertificateChain {
            certificate_pem: certificate.pem(),
            ca_chain_pem: ca_pem,
        })
    }
}

fn unavailable() -> ConnectorError {
    ConnectorError::Response {
        status: 500,
        code: ErrorCode::Internal,
        message: "connector unavailable".to_string(),
    }
}

// === impl TestDirector ===

#[async_trait]
impl DirectorClient for TestDirector {
    async fn fetch_catalog(
        &self,
        credentials: &ClientCredentials,
        target: &RuntimeTarget,
    ) -> Result<Catalog, DirectorError> {
        assert_eq!(target.director_url, "https://director.example.com/graphql");
        assert_eq!(target.runtime_id, "rt-1");
        assert_eq!(target.tenant, "tenant-1");

        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.fetches += 1;
        state
            .certificates
            .push(credentials.certificate_pem.clone());
        match &state.error {
            Some(message) => Err(DirectorError::Transport(message.clone())),
            None => Ok(Catalog {
                applications: state.catalog.clone(),
                rejected: state.rejected.clone(),
            }),
        }
    }

    async fn set_runtime_labels(
        &self,
        _: &ClientCredentials,
        _: &RuntimeTarget,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DirectorError> {
        self.state.lock().labels.push(labels.clone());
        Ok(())
    }
}
