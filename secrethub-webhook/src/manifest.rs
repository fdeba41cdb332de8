//! Pod manifests for the offline `mutate` command.

use std::io::Read;
use std::path::Path;

use anyhow::Context as _;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;
use crate::mutator::{Mutator, Outcome};

/// Reads the manifest at `path`, or stdin when no path is given.
pub fn read(path: Option<&Path>) -> Result<String> {
    let content = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    Ok(content)
}

/// Decodes a YAML or JSON manifest, JSON being a subset of YAML.
pub fn decode<K: DeserializeOwned>(content: &str) -> Result<K> {
    Ok(serde_yaml::from_str(content).context("invalid manifest")?)
}

pub fn encode<K: Serialize>(resource: &K) -> Result<String> {
    Ok(serde_yaml::to_string(resource)?)
}

/// Runs the pod in `content` through the mutator and renders the pod that
/// would be admitted.
pub fn render(mutator: &Mutator, content: &str) -> Result<String> {
    let pod: Pod = decode(content)?;
    match mutator.mutate(&pod)? {
        Outcome::Mutated(mutated) => encode(&*mutated),
        Outcome::Unchanged => encode(&pod),
    }
}
