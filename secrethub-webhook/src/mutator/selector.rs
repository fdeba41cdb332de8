use std::collections::BTreeSet;

use clap::ValueEnum;
use k8s_openapi_ext::corev1::{Container, EnvVar};

/// Prefix of an environment value that refers to a SecretHub secret.
pub const SECRET_REFERENCE_PREFIX: &str = "secrethub://";

/// Decides which containers of an annotated pod get wrapped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetPolicy {
    /// Every container that references a `secrethub://` secret in its
    /// environment. The mutate annotation only has to be present.
    SecretReferences,
    /// Only the containers listed in the mutate annotation, whether or not
    /// they reference any secrets.
    #[default]
    NamedContainers,
}

impl TargetPolicy {
    /// Builds the selector for one pod from the value of its mutate annotation.
    pub fn selector(self, annotation: &str) -> Selector {
        match self {
            Self::SecretReferences => Selector::SecretReferences,
            Self::NamedContainers => Selector::Named(parse_names(annotation)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    SecretReferences,
    Named(BTreeSet<String>),
}

impl Selector {
    pub fn matches(&self, container: &Container) -> bool {
        match self {
            Self::SecretReferences => has_secret_references(container.env.as_deref()),
            Self::Named(names) => names.contains(&container.name),
        }
    }
}

/// Splits a comma separated list of container names. Segments are trimmed and
/// empty ones are dropped, so `"app,,"` never matches a container without a name.
fn parse_names(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

pub fn has_secret_references(env: Option<&[EnvVar]>) -> bool {
    env.unwrap_or_default().iter().any(|var| {
        var.value
            .as_deref()
            .is_some_and(|value| value.starts_with(SECRET_REFERENCE_PREFIX))
    })
}
