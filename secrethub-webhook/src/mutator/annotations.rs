use std::collections::BTreeMap;

use super::selector::{Selector, TargetPolicy};

pub const ANNOTATION_MUTATE: &str = "secrethub.io/mutate";
pub const ANNOTATION_VERSION: &str = "secrethub.io/version";
pub const ANNOTATION_IMAGE: &str = "secrethub.io/image";

pub const DEFAULT_VERSION: &str = "latest";

/// What a single pod asks for through its annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub selector: Selector,
    pub version: String,
    pub image: Option<String>,
}

impl Directive {
    /// Reads the directive from a pod's annotations, `None` when the pod did not
    /// opt in. Unknown annotations are ignored.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        policy: TargetPolicy,
    ) -> Option<Self> {
        let targets = annotations.get(ANNOTATION_MUTATE)?;

        let version = annotations
            .get(ANNOTATION_VERSION)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_VERSION)
            .to_string();

        let image = annotations
            .get(ANNOTATION_IMAGE)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(String::from);

        Some(Self {
            selector: policy.selector(targets),
            version,
            image,
        })
    }

    /// Image reference of the init container that provides the CLI binary.
    /// An image override always wins over the version.
    pub fn cli_image(&self, registry: &str) -> String {
        match self.image {
            Some(ref image) => image.clone(),
            None => format!("{}/cli:{}", registry.trim_end_matches('/'), self.version),
        }
    }
}
