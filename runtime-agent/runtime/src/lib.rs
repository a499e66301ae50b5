#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use compass_runtime_agent_compass as compass;
pub use compass_runtime_agent_core as core;
pub use compass_runtime_agent_k8s_api as k8s;
pub use compass_runtime_agent_k8s_sync as sync;

mod args;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod driver;
pub mod duration;
mod lease;
pub mod metrics;

pub use self::args::Args;
