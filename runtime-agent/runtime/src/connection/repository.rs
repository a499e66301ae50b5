use crate::k8s::{
    is_conflict, Api, Client, CompassConnection, CompassConnectionSpec, CompassConnectionStatus,
    Patch, PatchParams, PostParams,
};
use async_trait::async_trait;
use compass_runtime_agent_k8s_sync::RepositoryError;
use parking_lot::Mutex;
use std::sync::Arc;

const KIND: &str = "CompassConnection";
const FIELD_MANAGER: &str = "compass-runtime-agent";

/// Every status field, so that a merge patch clears the ones that are unset.
const STATUS_FIELDS: [&str; 8] = [
    "state",
    "established",
    "renewed",
    "lastSync",
    "lastSyncSuccess",
    "lastConnectionStatus",
    "lastSyncStatus",
    "certificate",
];

#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CompassConnection>, RepositoryError>;

    /// Fails with [`RepositoryError::AlreadyExists`] if another writer got
    /// there first.
    async fn create(
        &self,
        connection: &CompassConnection,
    ) -> Result<CompassConnection, RepositoryError>;

    async fn update_spec(
        &self,
        name: &str,
        spec: &CompassConnectionSpec,
    ) -> Result<(), RepositoryError>;

    /// Replaces the status as a whole.
    async fn update_status(
        &self,
        name: &str,
        status: &CompassConnectionStatus,
    ) -> Result<(), RepositoryError>;
}

#[derive(Clone)]
pub struct KubeConnections {
    api: Api<CompassConnection>,
}

/// A process-local connection resource.
#[derive(Clone, Debug, Default)]
pub struct InMemoryConnections {
    inner: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    connection: Option<CompassConnection>,
    status_writes: usize,
    fail_writes: bool,
}

// === impl KubeConnections ===

impl KubeConnections {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ConnectionRepository for KubeConnections {
    async fn get(&self, name: &str) -> Result<Option<CompassConnection>, RepositoryError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(
        &self,
        connection: &CompassConnection,
    ) -> Result<CompassConnection, RepositoryError> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.api.create(&params, connection).await {
            Ok(created) => Ok(created),
            Err(error) if is_conflict(&error) => Err(RepositoryError::AlreadyExists {
                kind: KIND,
                name: connection.metadata.name.clone().unwrap_or_default(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    async fn update_spec(
        &self,
        name: &str,
        spec: &CompassConnectionSpec,
    ) -> Result<(), RepositoryError> {
        let patch = serde_json::json!({ "spec": spec });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        name: &str,
        status: &CompassConnectionStatus,
    ) -> Result<(), RepositoryError> {
        let patch = serde_json::json!({ "status": status_patch(status) });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

fn status_patch(status: &CompassConnectionStatus) -> serde_json::Value {
    let mut value = serde_json::to_value(status).unwrap_or_default();
    if let Some(fields) = value.as_object_mut() {
        for field in STATUS_FIELDS {
            fields
                .entry(field.to_string())
                .or_insert(serde_json::Value::Null);
        }
    }
    value
}

// === impl InMemoryConnections ===

impl InMemoryConnections {
    pub fn current(&self) -> Option<CompassConnection> {
        self.inner.lock().connection.clone()
    }

    pub fn status(&self) -> CompassConnectionStatus {
        self.current()
            .and_then(|c| c.status)
            .unwrap_or_default()
    }

    pub fn status_writes(&self) -> usize {
        self.inner.lock().status_writes
    }

    /// Changes the spec as an operator would.
    pub fn edit_spec(&self, edit: impl FnOnce(&mut CompassConnectionSpec)) {
        if let Some(connection) = self.inner.lock().connection.as_mut() {
            edit(&mut connection.spec);
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    fn check(state: &State, name: &str) -> Result<(), RepositoryError> {
        if state.fail_writes {
            return Err(RepositoryError::Rejected(format!(
                "injected failure writing {name}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionRepository for InMemoryConnections {
    async fn get(&self, name: &str) -> Result<Option<CompassConnection>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .connection
            .clone()
            .filter(|c| c.metadata.name.as_deref() == Some(name)))
    }

    async fn create(
        &self,
        connection: &CompassConnection,
    ) -> Result<CompassConnection, RepositoryError> {
        let mut state = self.inner.lock();
        let name = connection.metadata.name.clone().unwrap_or_default();
        Self::check(&state, &name)?;
        if state.connection.is_some() {
            return Err(RepositoryError::AlreadyExists { kind: KIND, name });
        }
        state.connection = Some(connection.clone());
        Ok(connection.clone())
    }

    async fn update_spec(
        &self,
        name: &str,
        spec: &CompassConnectionSpec,
    ) -> Result<(), RepositoryError> {
        let mut state = self.inner.lock();
        Self::check(&state, name)?;
        let connection = state
            .connection
            .as_mut()
            .ok_or_else(|| RepositoryError::NotFound {
                kind: KIND,
                name: name.to_string(),
            })?;
        connection.spec = spec.clone();
        Ok(())
    }

    async fn update_status(
        &self,
        name: &str,
        status: &CompassConnectionStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.inner.lock();
        Self::check(&state, name)?;
        let connection = state
            .connection
            .as_mut()
            .ok_or_else(|| RepositoryError::NotFound {
                kind: KIND,
                name: name.to_string(),
            })?;
        connection.status = Some(status.clone());
        state.status_writes += 1;
        Ok(())
    }
}
