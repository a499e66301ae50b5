//! Elects the replica that reconciles. Only the holder of the Lease writes the
//! CompassConnection and the Applications; other replicas stand by.

use crate::k8s::{
    self,
    api::{apps::v1::Deployment, coordination::v1::Lease},
    Api, Client, ObjectMeta, PostParams, Resource,
};
use anyhow::Result;
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long a claim is valid without being renewed.
const CLAIM_TTL: Duration = Duration::from_secs(30);

/// How long before expiry the holder renews its claim.
const RENEW_AHEAD: Duration = Duration::from_secs(1);

/// Identifies the Lease and the replica competing for it.
#[derive(Clone, Debug)]
pub struct Election {
    pub namespace: String,
    pub lease: String,

    /// The agent's Deployment. When it exists it owns the Lease, so the
    /// Lease is removed with the agent.
    pub deployment: String,

    /// This replica's name, usually the pod's hostname.
    pub identity: String,
}

// === impl Election ===

impl Election {
    /// Ensures the Lease exists and starts competing for it. The receiver
    /// always holds the latest claim.
    pub async fn join(&self, client: Client) -> Result<watch::Receiver<Arc<Claim>>> {
        let leases = Api::<Lease>::namespaced(client.clone(), &self.namespace);
        let deployment = self.deployment(client).await?;
        self.create_lease(&leases, deployment.as_ref()).await?;

        let params = ClaimParams {
            lease_duration: CLAIM_TTL,
            renew_grace_period: RENEW_AHEAD,
        };
        let (claims, _task) = LeaseManager::init(leases, &self.lease)
            .await?
            .spawn(&self.identity, params)
            .await?;
        info!(lease = %self.lease, identity = %self.identity, "Competing for leadership");
        Ok(claims)
    }

    async fn deployment(&self, client: Client) -> Result<Option<Deployment>> {
        let deployments = Api::<Deployment>::namespaced(client, &self.namespace);
        let deployment = deployments.get_opt(&self.deployment).await?;
        if deployment.is_none() {
            warn!(
                deployment = %self.deployment,
                "Agent Deployment not found; the Lease will outlive the agent"
            );
        }
        Ok(deployment)
    }

    async fn create_lease(&self, leases: &Api<Lease>, owner: Option<&Deployment>) -> Result<()> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(k8s::labels::managed()),
                owner_references: owner
                    .and_then(|d| d.controller_owner_ref(&()))
                    .map(|o| vec![o]),
                ..Default::default()
            },
            spec: None,
        };
        let params = PostParams {
            field_manager: Some(k8s::labels::MANAGED_BY_AGENT.to_string()),
            ..Default::default()
        };
        match leases.create(&params, &lease).await {
            Ok(_) => info!(lease = %self.lease, "Created Lease"),
            Err(error) if k8s::is_conflict(&error) => debug!(lease = %self.lease, "Lease exists"),
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }
}
