#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod connector;
mod director;
mod graphql;
mod tls;

pub use self::{
    connector::HttpConnectorClient, director::GraphQlDirectorClient, tls::ClientConfig,
};
