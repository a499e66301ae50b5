#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Converges the Application resources and credential secrets in the
//! applications namespace on the catalog served by the Director.

pub mod memory;
pub mod naming;
mod repository;
mod resources;
mod service;


pub use self::{
    repository::{
        ApplicationRepository, KubeApplications, KubeSecrets, RepositoryError, SecretRepository,
    },
    service::{
        plan, ApplicationFailure, ApplyError, Operation, SyncError, SyncErrors, SyncPlan,
        SyncReport, Synchronize, Synchronizer, MAX_CONFLICT_RETRIES,
    },
};
