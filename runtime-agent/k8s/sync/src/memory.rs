//! In-memory repositories with failure injection, used to exercise the sync
//! logic without an API server.

use crate::repository::{ApplicationRepository, RepositoryError, SecretRepository};
use async_trait::async_trait;
use compass_runtime_agent_k8s_api::{self as k8s, labels, Resource, ResourceExt, Secret};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Default)]
pub struct InMemoryApplications {
    inner: Arc<Mutex<Store<k8s::Application>>>,
}

#[derive(Clone, Debug, Default)]
pub struct InMemorySecrets {
    inner: Arc<Mutex<Store<Secret>>>,
}

#[derive(Debug)]
struct Store<T> {
    objects: BTreeMap<String, T>,
    next_version: u64,
    writes: usize,
    failing: BTreeSet<String>,
    conflicts: BTreeMap<String, usize>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_version: 1,
            writes: 0,
            failing: BTreeSet::new(),
            conflicts: BTreeMap::new(),
        }
    }
}

impl<T: k8s::Resource + Clone> Store<T> {
    fn check(&self, name: &str) -> Result<(), RepositoryError> {
        if self.failing.contains(name) {
            return Err(RepositoryError::Rejected(format!("injected failure for {name}")));
        }
        Ok(())
    }

    fn create(&mut self, kind: &'static str, obj: &T) -> Result<T, RepositoryError> {
        let name = obj.name_any();
        self.check(&name)?;
        if self.objects.contains_key(&name) {
            return Err(RepositoryError::AlreadyExists { kind, name });
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = Some(self.bump());
        self.objects.insert(name, obj.clone());
        self.writes += 1;
        Ok(obj)
    }

    fn update(&mut self, kind: &'static str, obj: &T) -> Result<T, RepositoryError> {
        let name = obj.name_any();
        self.check(&name)?;
        if let Some(pending) = self.conflicts.get_mut(&name) {
            if *pending > 0 {
                *pending -= 1;
                self.touch(&name);
                return Err(RepositoryError::Conflict { kind, name });
            }
        }
        let current = self
            .objects
            .get(&name)
            .ok_or_else(|| RepositoryError::NotFound {
                kind,
                name: name.clone(),
            })?;
        if obj.meta().resource_version.is_some()
            && obj.meta().resource_version != current.meta().resource_version
        {
            return Err(RepositoryError::Conflict { kind, name });
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = Some(self.bump());
        self.objects.insert(name, obj.clone());
        self.writes += 1;
        Ok(obj)
    }

    fn delete(&mut self, name: &str) -> Result<(), RepositoryError> {
        self.check(name)?;
        if self.objects.remove(name).is_some() {
            self.writes += 1;
        }
        Ok(())
    }

    /// Simulates a concurrent writer bumping the resource version.
    fn touch(&mut self, name: &str) {
        let version = self.bump();
        if let Some(obj) = self.objects.get_mut(name) {
            obj.meta_mut().resource_version = Some(version);
        }
    }

    fn bump(&mut self) -> String {
        let version = self.next_version;
        self.next_version += 1;
        version.to_string()
    }
}

macro_rules! test_hooks {
    ($ty:ty, $obj:ty) => {
        impl $ty {
            /// Stores `obj` as-is, without counting a write.
            pub fn insert(&self, obj: $obj) {
                let mut store = self.inner.lock();
                let mut obj = obj;
                obj.meta_mut().resource_version = Some(store.bump());
                store.objects.insert(obj.name_any(), obj);
            }

            pub fn get_stored(&self, name: &str) -> Option<$obj> {
                self.inner.lock().objects.get(name).cloned()
            }

            pub fn names(&self) -> Vec<String> {
                self.inner.lock().objects.keys().cloned().collect()
            }

            /// The number of successful creates, updates and deletes.
            pub fn writes(&self) -> usize {
                self.inner.lock().writes
            }

            /// Makes every write of `name` fail until [`Self::heal`] is called.
            pub fn fail(&self, name: &str) {
                self.inner.lock().failing.insert(name.to_string());
            }

            pub fn heal(&self, name: &str) {
                self.inner.lock().failing.remove(name);
            }

            /// Makes the next `count` updates of `name` fail with a conflict,
            /// as if another writer got there first.
            pub fn conflict(&self, name: &str, count: usize) {
                self.inner.lock().conflicts.insert(name.to_string(), count);
            }
        }
    };
}

test_hooks!(InMemoryApplications, k8s::Application);
test_hooks!(InMemorySecrets, Secret);

#[async_trait]
impl ApplicationRepository for InMemoryApplications {
    async fn list(&self) -> Result<Vec<k8s::Application>, RepositoryError> {
        let store = self.inner.lock();
        Ok(store
            .objects
            .values()
            .filter(|app| {
                app.labels().get(labels::MANAGED_BY).map(String::as_str)
                    == Some(labels::MANAGED_BY_AGENT)
            })
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<k8s::Application>, RepositoryError> {
        Ok(self.inner.lock().objects.get(name).cloned())
    }

    async fn create(&self, app: &k8s::Application) -> Result<k8s::Application, RepositoryError> {
        self.inner.lock().create("Application", app)
    }

    async fn update(&self, app: &k8s::Application) -> Result<k8s::Application, RepositoryError> {
        self.inner.lock().update("Application", app)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.inner.lock().delete(name)
    }
}

#[async_trait]
impl SecretRepository for InMemorySecrets {
    async fn get(&self, name: &str) -> Result<Option<Secret>, RepositoryError> {
        Ok(self.inner.lock().objects.get(name).cloned())
    }

    async fn list_owned(&self, application: &str) -> Result<Vec<String>, RepositoryError> {
        let store = self.inner.lock();
        Ok(store
            .objects
            .iter()
            .filter(|(_, secret)| labels::is_owned_by(secret.labels(), application))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create(&self, secret: &Secret) -> Result<(), RepositoryError> {
        self.inner.lock().create("Secret", secret).map(drop)
    }

    async fn update(&self, secret: &Secret) -> Result<(), RepositoryError> {
        self.inner.lock().update("Secret", secret).map(drop)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.inner.lock().delete(name)
    }
}
