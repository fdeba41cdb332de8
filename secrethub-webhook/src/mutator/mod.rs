//! Pod mutation engine.
//!
//! A pod opts in through the `secrethub.io/mutate` annotation. Every selected
//! container gets its command wrapped in `secrethub run --` and a read-only
//! mount of the shared volume that holds the CLI binary. A single init container
//! copies that binary into the volume before anything else runs.
//!
//! The engine is a pure function over [`Pod`]: it performs no I/O and the caller's
//! pod is never touched, a mutated copy is handed back instead.

mod annotations;
mod selector;

pub use annotations::{
    ANNOTATION_IMAGE, ANNOTATION_MUTATE, ANNOTATION_VERSION, DEFAULT_VERSION, Directive,
};
pub use selector::{SECRET_REFERENCE_PREFIX, Selector, TargetPolicy, has_secret_references};

use k8s_openapi_ext::corev1::{Container, EmptyDirVolumeSource, EnvVar, Pod, Volume, VolumeMount};
use k8s_openapi_ext::{ContainerExt, EnvVarExt, VolumeExt, VolumeMountExt};
use thiserror::Error;

use crate::helper::CmdBuilder;

/// Name of the in-memory volume that holds the CLI binary.
pub const BIN_VOLUME_NAME: &str = "secrethub-bin";
/// Where the shared volume is mounted, in the init container and in every wrapped container.
pub const BIN_VOLUME_MOUNT_PATH: &str = "/secrethub/bin/";
/// Path of the CLI binary inside wrapped containers.
pub const BIN_PATH: &str = "/secrethub/bin/secrethub";
pub const COPY_CONTAINER_NAME: &str = "copy-secrethub-bin";
pub const DEFAULT_REGISTRY: &str = "secrethub";

/// Location of the binary in the CLI image.
const CLI_IMAGE_BIN_PATH: &str = "/usr/bin/secrethub";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The command must be set in the podspec, an `ENTRYPOINT` or `CMD` baked
    /// into the image is not visible to the webhook.
    #[error(
        "not attaching SecretHub to the container {container}: the podspec does not define a command"
    )]
    MissingCommand { container: String },
}

/// Identifies this webhook to the CLI running inside wrapped containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: "kubernetes-mutating-webhook".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppInfo {
    pub const ENV_NAME: &'static str = "SECRETHUB_APP_INFO_NAME";
    pub const ENV_VERSION: &'static str = "SECRETHUB_APP_INFO_VERSION";

    fn env(&self) -> [EnvVar; 2] {
        [
            EnvVar::value(Self::ENV_NAME, &self.name),
            EnvVar::value(Self::ENV_VERSION, &self.version),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// Registry the `cli` image is pulled from when the pod does not override the image.
    pub registry: String,
    pub policy: TargetPolicy,
    /// Append the [`AppInfo`] environment variables to wrapped containers.
    pub inject_app_info: bool,
    pub app_info: AppInfo,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            policy: TargetPolicy::default(),
            inject_app_info: false,
            app_info: AppInfo::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing to do, the pod can be admitted as is.
    Unchanged,
    Mutated(Box<Pod>),
}

impl Outcome {
    pub fn is_mutated(&self) -> bool {
        matches!(self, Self::Mutated(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mutator {
    config: MutatorConfig,
}

impl Mutator {
    pub fn new(config: MutatorConfig) -> Self {
        Self { config }
    }

    /// The directive the pod's annotations ask for, if it opted in at all.
    fn directive(&self, pod: &Pod) -> Option<Directive> {
        let annotations = pod.metadata.annotations.as_ref()?;
        Directive::from_annotations(annotations, self.config.policy)
    }

    /// Rewrites the selected containers of `pod`.
    ///
    /// Init containers are visited before regular containers, both in their
    /// original order. The first container without a command aborts the whole
    /// mutation.
    pub fn mutate(&self, pod: &Pod) -> Result<Outcome, Error> {
        let Some(directive) = self.directive(pod) else {
            return Ok(Outcome::Unchanged);
        };

        let mut pod = pod.clone();
        let Some(spec) = pod.spec.as_mut() else {
            return Ok(Outcome::Unchanged);
        };

        let volume = bin_volume();
        let mut mutated = false;

        let containers = spec
            .init_containers
            .iter_mut()
            .flatten()
            .chain(spec.containers.iter_mut());

        for container in containers {
            mutated |= self.mutate_container(container, &directive.selector, &volume)?;
        }

        if !mutated {
            return Ok(Outcome::Unchanged);
        }

        // The copy container is prepended last so it is never a candidate itself.
        let copy = self.copy_container(&directive, &volume);
        spec.init_containers.get_or_insert_default().insert(0, copy);
        spec.volumes.get_or_insert_default().push(volume);

        Ok(Outcome::Mutated(Box::new(pod)))
    }

    fn mutate_container(
        &self,
        container: &mut Container,
        selector: &Selector,
        volume: &Volume,
    ) -> Result<bool, Error> {
        if !selector.matches(container) {
            return Ok(false);
        }

        let command = match container.command.as_deref() {
            Some(command) if !command.is_empty() => CmdBuilder::new(BIN_PATH)
                .arg("run")
                .arg("--")
                .args(command)
                .collect(),
            _ => {
                return Err(Error::MissingCommand {
                    container: container.name.clone(),
                });
            }
        };

        container.command = Some(command);
        container
            .volume_mounts
            .get_or_insert_default()
            .push(VolumeMount::new(BIN_VOLUME_MOUNT_PATH, volume).read_only());

        if self.config.inject_app_info {
            container
                .env
                .get_or_insert_default()
                .extend(self.config.app_info.env());
        }

        Ok(true)
    }

    fn copy_container(&self, directive: &Directive, volume: &Volume) -> Container {
        let copy = format!("cp {CLI_IMAGE_BIN_PATH} {BIN_VOLUME_MOUNT_PATH}");

        Container::new(COPY_CONTAINER_NAME)
            .image(directive.cli_image(&self.config.registry))
            .image_pull_policy("IfNotPresent")
            .command(CmdBuilder::new("sh").arg("-c").arg(copy).collect())
            .volume_mounts([VolumeMount::new(BIN_VOLUME_MOUNT_PATH, volume)])
    }
}

fn bin_volume() -> Volume {
    let source = EmptyDirVolumeSource {
        medium: Some("Memory".to_string()),
        ..Default::default()
    };
    Volume::emptydir(BIN_VOLUME_NAME, source)
}
