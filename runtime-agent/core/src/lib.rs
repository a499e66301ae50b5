#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod catalog;
pub mod certificate;
pub mod connector;
pub mod credentials;
pub mod director;
mod error;

pub use self::{
    certificate::{CertificateError, CertificateInfo, CertificateManager, RenewalError},
    connector::{ConnectorClient, ConnectorError, ErrorCode},
    credentials::{ClientCredentials, CredentialStore, InMemoryCredentialStore, StoreError},
    director::{DirectorClient, DirectorError, RuntimeTarget},
    error::ErrorKind,
};
