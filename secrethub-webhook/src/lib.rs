//! Kubernetes mutating admission webhook that runs selected containers of a pod
//! through `secrethub run --`, so secrets referenced in their environment are
//! resolved at startup instead of being stored in the cluster.

use thiserror::Error;

pub mod admission;
pub mod helper;
pub mod manifest;
pub mod mutator;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Mutate(#[from] mutator::Error),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("kubus error: {0}")]
    Kubus(#[from] kubus::Error),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
    #[error("invalid json pointer: {0}")]
    JsonPtr(#[from] json_patch::jsonptr::ParseError),
    #[error("failed to serialize patch: {0}")]
    SerializePatch(#[from] kube::core::admission::SerializePatchError),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
