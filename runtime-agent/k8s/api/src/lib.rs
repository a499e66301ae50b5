#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod application;
pub mod compass_connection;
pub mod labels;

pub use self::{
    application::{Application, ApplicationSpec},
    compass_connection::{
        CompassConnection, CompassConnectionSpec, CompassConnectionStatus, ConnectionState,
    },
};
pub use k8s_openapi::{
    api::{self, core::v1::Secret},
    ByteString,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};

/// Returns true if the API server rejected a write because the object changed
/// since it was read.
pub fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: 409, .. }))
}

pub fn is_not_found(error: &Error) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: 404, .. }))
}
