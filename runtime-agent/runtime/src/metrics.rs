use crate::k8s::ConnectionState;
use compass_runtime_agent_k8s_sync::SyncReport;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ConnectionMetrics {
    reconciles: Family<StateLabels, Counter>,
    reconcile_errors: Counter,
    renewals: Family<OutcomeLabels, Counter>,
    applications: Family<OperationLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StateLabels {
    state: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    operation: &'static str,
}

impl ConnectionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Count of completed reconciles by the resulting connection state",
            reconciles.clone(),
        );

        let reconcile_errors = Counter::default();
        reg.register(
            "reconcile_errors",
            "Count of reconciles that could not read or write the CompassConnection",
            reconcile_errors.clone(),
        );

        let renewals = Family::default();
        reg.register(
            "certificate_renewals",
            "Count of client certificate requests by outcome",
            renewals.clone(),
        );

        let applications = Family::default();
        reg.register(
            "synchronized_applications",
            "Count of Applications written by the synchronization service",
            applications.clone(),
        );

        Self {
            reconciles,
            reconcile_errors,
            renewals,
            applications,
        }
    }

    pub(crate) fn reconciled(&self, state: ConnectionState) {
        let state = match state {
            ConnectionState::Connected => "Connected",
            ConnectionState::ConnectionFailed => "ConnectionFailed",
            ConnectionState::Synchronized => "Synchronized",
            ConnectionState::SynchronizationFailed => "SynchronizationFailed",
        };
        self.reconciles.get_or_create(&StateLabels { state }).inc();
    }

    pub(crate) fn reconcile_failed(&self) {
        self.reconcile_errors.inc();
    }

    pub(crate) fn certificate_requested(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.renewals.get_or_create(&OutcomeLabels { outcome }).inc();
    }

    pub(crate) fn synchronized(&self, report: &SyncReport) {
        for (operation, names) in [
            ("create", &report.created),
            ("update", &report.updated),
            ("delete", &report.deleted),
        ] {
            self.applications
                .get_or_create(&OperationLabels { operation })
                .inc_by(names.len() as u64);
        }
    }
}
