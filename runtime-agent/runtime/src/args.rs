use crate::{
    config::{SecretConfigProvider, SecretRef},
    connection::{self, Collaborators, ConnectionSupervisor, KubeConnections, Settings},
    credentials::SecretCredentialStore,
    driver::{self, Driver, Leadership},
    duration::GoDuration,
    k8s::{compass_connection, watcher, CompassConnection},
    lease::Election,
    metrics::ConnectionMetrics,
};
use anyhow::{bail, Result};
use clap::Parser;
use compass_runtime_agent_compass::{ClientConfig, GraphQlDirectorClient, HttpConnectorClient};
use compass_runtime_agent_k8s_sync::{KubeApplications, KubeSecrets, Synchronizer};
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, info_span, Instrument};

const EVENTS_URL_LABEL: &str = "runtime_eventServiceUrl";
const CONSOLE_URL_LABEL: &str = "runtime_consoleUrl";

#[derive(Debug, Parser)]
#[clap(
    name = "compass-runtime-agent",
    about = "Connects a runtime to Compass and synchronizes its Applications"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "compass_runtime_agent=info,warn",
        env = "COMPASS_RUNTIME_AGENT_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The minimum time between two synchronizations with the Director.
    #[clap(long, default_value = "15s", env = "MINIMAL_COMPASS_SYNC_TIME")]
    minimal_compass_sync_time: GoDuration,

    /// The fraction of the certificate's validity after which it is renewed.
    #[clap(
        long,
        default_value = "0.3",
        env = "CERT_VALIDITY_RENEWAL_THRESHOLD",
        value_parser = parse_threshold
    )]
    cert_validity_renewal_threshold: f64,

    #[clap(long, default_value = "20s", env = "CONTROLLER_SYNC_PERIOD")]
    controller_sync_period: GoDuration,

    /// The secret holding the Connector URL, one-time token, runtime id and
    /// tenant, as `namespace/name`.
    #[clap(
        long,
        default_value = "compass-system/compass-agent-configuration",
        env = "AGENT_CONFIGURATION_SECRET"
    )]
    agent_config_secret: SecretRef,

    /// The secret in which the client certificate, its key and the CA chain
    /// are stored, as `namespace/name`.
    #[clap(
        long,
        default_value = "kyma-integration/cluster-client-certificates",
        env = "CLUSTER_CERTIFICATES_SECRET"
    )]
    cluster_cert_secret: SecretRef,

    /// The namespace in which Applications and their secrets are written.
    #[clap(long, default_value = "kyma-integration", env = "INTEGRATION_NAMESPACE")]
    apps_namespace: String,

    /// Bounds every request to Compass. A whole reconcile is bounded by a
    /// multiple of this.
    #[clap(long, default_value = "30s", env = "REQUEST_TIMEOUT")]
    request_timeout: GoDuration,

    #[clap(long, env = "SKIP_COMPASS_TLS_VERIFY")]
    skip_compass_tls_verify: bool,

    /// Published to the Director as the runtime's event service URL.
    #[clap(long, env = "RUNTIME_EVENTS_URL")]
    runtime_events_url: Option<String>,

    /// Published to the Director as the runtime's console URL.
    #[clap(long, env = "RUNTIME_CONSOLE_URL")]
    runtime_console_url: Option<String>,

    /// The namespace of the Lease that elects the active replica.
    #[clap(long, default_value = "compass-system", env = "POD_NAMESPACE")]
    lease_namespace: String,

    #[clap(long, default_value = "compass-runtime-agent", env = "LEASE_NAME")]
    lease_name: String,

    /// Owns the Lease when it exists.
    #[clap(long, default_value = "compass-runtime-agent")]
    agent_deployment_name: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            minimal_compass_sync_time,
            cert_validity_renewal_threshold,
            controller_sync_period,
            agent_config_secret,
            cluster_cert_secret,
            apps_namespace,
            request_timeout,
            skip_compass_tls_verify,
            runtime_events_url,
            runtime_console_url,
            lease_namespace,
            lease_name,
            agent_deployment_name,
        } = self;

        let mut prom = <Registry>::default();
        let metrics =
            ConnectionMetrics::register(prom.sub_registry_with_prefix("compass_connection"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname = match std::env::var("HOSTNAME") {
            Ok(hostname) => hostname,
            Err(error) => bail!("failed to read the HOSTNAME environment variable: {error}"),
        };
        let claims = Election {
            namespace: lease_namespace,
            lease: lease_name,
            deployment: agent_deployment_name,
            identity: hostname.clone(),
        }
        .join(runtime.client())
        .await?;

        let client_config = ClientConfig {
            timeout: request_timeout.into(),
            skip_tls_verify: skip_compass_tls_verify,
        };
        let kube = runtime.client();
        let synchronizer = Synchronizer::new(
            KubeApplications::new(kube.clone(), &apps_namespace),
            KubeSecrets::new(kube.clone(), &apps_namespace),
            apps_namespace.clone(),
        );
        let supervisor = ConnectionSupervisor::new(
            Collaborators {
                connections: Arc::new(KubeConnections::new(kube.clone())),
                credentials: Arc::new(SecretCredentialStore::new(
                    kube.clone(),
                    cluster_cert_secret,
                )),
                config: Arc::new(SecretConfigProvider::new(kube, agent_config_secret)),
                connector: Arc::new(HttpConnectorClient::new(client_config.clone())?),
                director: Arc::new(GraphQlDirectorClient::new(client_config)),
                synchronizer: Arc::new(synchronizer),
            },
            cert_validity_renewal_threshold,
            Settings {
                minimal_sync_time: minimal_compass_sync_time.into(),
                sync_period: controller_sync_period.into(),
                runtime_labels: runtime_labels(runtime_events_url, runtime_console_url),
            },
            metrics,
        );

        let events = runtime.watch_all::<CompassConnection>(
            watcher::Config::default()
                .fields(&format!("metadata.name={}", compass_connection::NAME)),
        );
        let driver = Driver::new(
            compass_connection::NAME,
            supervisor,
            connection::reconcile_timeout(request_timeout.into()),
            controller_sync_period.into(),
        )
        .with_leadership(Leadership::new(claims, hostname));
        let drain = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                let shutdown = drain.signaled().map(|_release| ());
                driver.run(driver::spec_changes(events), shutdown).await
            }
            .instrument(info_span!("compass_connection")),
        );

        info!(namespace = %apps_namespace, "Compass runtime agent started");

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn parse_threshold(s: &str) -> Result<f64> {
    let threshold = s.parse::<f64>()?;
    if !(threshold > 0.0 && threshold <= 1.0) {
        bail!("renewal threshold must be in (0, 1]: {threshold}");
    }
    Ok(threshold)
}

fn runtime_labels(
    events_url: Option<String>,
    console_url: Option<String>,
) -> BTreeMap<String, String> {
    [(EVENTS_URL_LABEL, events_url), (CONSOLE_URL_LABEL, console_url)]
        .into_iter()
        .filter_map(|(label, url)| Some((label.to_string(), url?)))
        .filter(|(_, url)| !url.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["compass-runtime-agent"]).unwrap();
        assert_eq!(
            Duration::from(args.minimal_compass_sync_time),
            Duration::from_secs(15)
        );
        assert_eq!(
            Duration::from(args.controller_sync_period),
            Duration::from_secs(20)
        );
        assert_eq!(args.cert_validity_renewal_threshold, 0.3);
        assert_eq!(args.apps_namespace, "kyma-integration");
        assert_eq!(
            args.agent_config_secret.to_string(),
            "compass-system/compass-agent-configuration"
        );
        assert!(!args.skip_compass_tls_verify);
        assert_eq!(
            connection::reconcile_timeout(args.request_timeout.into()),
            Duration::from_secs(210)
        );
    }

    #[test]
    fn go_durations() {
        let args = Args::try_parse_from([
            "compass-runtime-agent",
            "--minimal-compass-sync-time=1m30s",
            "--controller-sync-period=500ms",
        ])
        .unwrap();
        assert_eq!(
            Duration::from(args.minimal_compass_sync_time),
            Duration::from_secs(90)
        );
        assert_eq!(
            Duration::from(args.controller_sync_period),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn rejects_invalid_thresholds() {
        for threshold in ["0", "1.5", "-0.1", "soon"] {
            assert!(
                Args::try_parse_from([
                    "compass-runtime-agent",
                    "--cert-validity-renewal-threshold",
                    threshold,
                ])
                .is_err(),
                "{threshold} must be rejected"
            );
        }
    }

    #[test]
    fn labels_only_configured_urls() {
        assert_eq!(
            runtime_labels(Some("https://gateway.example.com".to_string()), None),
            btreemap! {
                EVENTS_URL_LABEL.to_string() => "https://gateway.example.com".to_string(),
            }
        );
        assert_eq!(
            runtime_labels(None, Some(String::new())),
            BTreeMap::new()
        );
    }
}
