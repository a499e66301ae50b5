//! Runs a reconciler for a single named resource: immediately on start, after
//! the delay the reconciler asks for, and whenever the resource's spec
//! changes.

use crate::k8s::{watcher, Resource};
use async_trait::async_trait;
use futures::prelude::*;
use kubert::lease::Claim;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

/// When the resource should be reconciled again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
}

#[async_trait]
pub trait Reconcile: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn reconcile(&self, name: &str) -> Result<Requeue, Self::Error>;
}

pub struct Driver<R> {
    name: String,
    reconciler: R,

    /// Bounds a single reconcile, so that a hung call cannot stall the loop.
    timeout: Duration,

    /// How long to wait after a failed or timed out reconcile.
    error_delay: Duration,
    leadership: Option<Leadership>,
}

/// Restricts reconciles to the current holder of a lease.
pub struct Leadership {
    claims: watch::Receiver<Arc<Claim>>,
    identity: String,
}

// === impl Driver ===

impl<R: Reconcile> Driver<R> {
    pub fn new(
        name: impl Into<String>,
        reconciler: R,
        timeout: Duration,
        error_delay: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            reconciler,
            timeout,
            error_delay,
            leadership: None,
        }
    }

    pub fn with_leadership(mut self, leadership: Leadership) -> Self {
        self.leadership = Some(leadership);
        self
    }

    /// Reconciles until `shutdown` completes. An in-flight reconcile is
    /// dropped on shutdown.
    pub async fn run<E, S>(mut self, events: E, shutdown: S)
    where
        E: Stream<Item = ()>,
        S: Future<Output = ()>,
    {
        // Once the events end, the timer alone drives reconciles.
        let events = events.fuse();
        tokio::pin!(events);
        tokio::pin!(shutdown);

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                Some(()) = events.next() => debug!(name = %self.name, "Spec changed"),
                () = time::sleep(delay) => {}
            }

            if let Some(leadership) = self.leadership.as_mut() {
                if !leadership.is_leader() {
                    debug!(name = %self.name, "Not the lease holder; waiting");
                    tokio::select! {
                        biased;
                        () = &mut shutdown => break,
                        () = leadership.changed() => {}
                        () = time::sleep(self.error_delay) => {}
                    }
                    delay = Duration::ZERO;
                    continue;
                }
            }

            delay = tokio::select! {
                biased;
                () = &mut shutdown => break,
                result = time::timeout(self.timeout, self.reconciler.reconcile(&self.name)) => {
                    self.requeue_after(result)
                }
            };
        }
        info!(name = %self.name, "Stopped reconciling");
    }

    fn requeue_after(
        &self,
        result: Result<Result<Requeue, R::Error>, time::error::Elapsed>,
    ) -> Duration {
        match result {
            Ok(Ok(Requeue::After(delay))) => {
                debug!(name = %self.name, ?delay, "Reconciled");
                delay
            }
            Ok(Err(error)) => {
                warn!(name = %self.name, %error, "Reconcile failed");
                self.error_delay
            }
            Err(_) => {
                warn!(name = %self.name, timeout = ?self.timeout, "Reconcile timed out");
                self.error_delay
            }
        }
    }
}

// === impl Leadership ===

impl Leadership {
    pub fn new(claims: watch::Receiver<Arc<Claim>>, identity: impl Into<String>) -> Self {
        Self {
            claims,
            identity: identity.into(),
        }
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.identity)
    }

    async fn changed(&mut self) {
        if self.claims.changed().await.is_err() {
            // The lease manager is gone; nothing will change anymore.
            future::pending::<()>().await;
        }
    }
}

/// Emits an item whenever a watched object is created, deleted or has its
/// generation bumped. Status writes do not change the generation, so the
/// driver's own updates are filtered out.
pub fn spec_changes<K>(events: impl Stream<Item = watcher::Event<K>>) -> impl Stream<Item = ()>
where
    K: Resource,
{
    let mut last = None;
    events.filter_map(move |event| {
        let changed = match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let generation = obj.meta().generation;
                let changed = generation.is_none() || generation != last;
                last = generation;
                changed
            }
            watcher::Event::Delete(_) => {
                last = None;
                true
            }
            watcher::Event::Init | watcher::Event::InitDone => false,
        };
        future::ready(changed.then_some(()))
    })
}
