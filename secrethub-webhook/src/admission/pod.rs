//! Admission entrypoint that feeds pods from the API server through the [`Mutator`].

use std::error::Error as StdError;

use async_trait::async_trait;
use json_patch::{AddOperation, Patch as JsonPatch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kubus::MutatingAdmissionHandler;
use serde::Serialize;

use super::ResourceGvkExt;
use crate::Error;
use crate::mutator::{Mutator, Outcome};

pub struct SecretHubMutator {
    mutator: Mutator,
}

impl SecretHubMutator {
    pub fn new(mutator: Mutator) -> Self {
        Self { mutator }
    }

    /// JSON patch that turns `pod` into its mutated form, `None` when the
    /// pod can be admitted as is.
    pub fn patch(&self, pod: &Pod) -> Result<Option<JsonPatch>, Error> {
        match self.mutator.mutate(pod)? {
            Outcome::Unchanged => Ok(None),
            Outcome::Mutated(mutated) => build_patch(pod, &mutated).map(Some),
        }
    }
}

/// Explicit operations for the fields the mutator touches.
///
/// The object received from the API server may carry fields the typed [`Pod`]
/// does not know about, so whole containers are never replaced. Existing
/// containers are addressed by their original index before the injected init
/// containers shift them.
fn build_patch(before: &Pod, after: &Pod) -> Result<JsonPatch, Error> {
    let mut ops = Vec::new();
    let (Some(before), Some(after)) = (before.spec.as_ref(), after.spec.as_ref()) else {
        return Ok(JsonPatch(ops));
    };

    let before_init = before.init_containers.as_deref().unwrap_or_default();
    let after_init = after.init_containers.as_deref().unwrap_or_default();
    let (injected, rewritten) =
        after_init.split_at(after_init.len().saturating_sub(before_init.len()));

    container_ops("/spec/initContainers", before_init, rewritten, &mut ops)?;
    container_ops("/spec/containers", &before.containers, &after.containers, &mut ops)?;

    if before.init_containers.is_none() {
        ops.push(add("/spec/initContainers", injected)?);
    } else {
        for (idx, container) in injected.iter().enumerate() {
            ops.push(add(&format!("/spec/initContainers/{idx}"), container)?);
        }
    }

    append_ops(
        "/spec/volumes",
        before.volumes.as_deref(),
        after.volumes.as_deref(),
        &mut ops,
    )?;

    Ok(JsonPatch(ops))
}

fn container_ops(
    path: &str,
    before: &[Container],
    after: &[Container],
    ops: &mut Vec<PatchOperation>,
) -> Result<(), Error> {
    for (idx, (before, after)) in before.iter().zip(after).enumerate() {
        if before.command != after.command {
            ops.push(PatchOperation::Replace(ReplaceOperation {
                path: format!("{path}/{idx}/command").parse()?,
                value: serde_json::to_value(&after.command)?,
            }));
        }
        append_ops(
            &format!("{path}/{idx}/volumeMounts"),
            before.volume_mounts.as_deref(),
            after.volume_mounts.as_deref(),
            ops,
        )?;
        append_ops(
            &format!("{path}/{idx}/env"),
            before.env.as_deref(),
            after.env.as_deref(),
            ops,
        )?;
    }
    Ok(())
}

/// Items the mutator appended to a list, added one by one or as a new list
/// when the field was absent.
fn append_ops<T: Serialize>(
    path: &str,
    before: Option<&[T]>,
    after: Option<&[T]>,
    ops: &mut Vec<PatchOperation>,
) -> Result<(), Error> {
    let after = after.unwrap_or_default();
    match before {
        None if after.is_empty() => {}
        None => ops.push(add(path, after)?),
        Some(before) => {
            for item in after.get(before.len()..).unwrap_or_default() {
                ops.push(add(&format!("{path}/-"), item)?);
            }
        }
    }
    Ok(())
}

fn add(path: &str, value: impl Serialize) -> Result<PatchOperation, Error> {
    Ok(PatchOperation::Add(AddOperation {
        path: path.parse()?,
        value: serde_json::to_value(value)?,
    }))
}

fn decode_pod(object: &DynamicObject) -> Result<Pod, Error> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Pods created by controllers usually only carry a `generateName` at admission time.
fn display_name(pod: &Pod) -> &str {
    pod.metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default()
}

#[async_trait]
impl MutatingAdmissionHandler for SecretHubMutator {
    type Err = Error;

    fn name(&self) -> &'static str {
        "secrethub"
    }

    async fn mutate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, Error> {
        let res = AdmissionResponse::from(req);
        if !Pod::is(&req.kind) {
            return Ok(res);
        }
        let Some(object) = req.object.as_ref() else {
            return Ok(res);
        };

        let pod = decode_pod(object)?;
        let name = display_name(&pod);
        let namespace = req.namespace.as_deref().unwrap_or_default();

        match self.patch(&pod) {
            Ok(Some(patch)) => {
                tracing::info!(
                    { pod = name, namespace = namespace, operations = patch.0.len() },
                    "wrapping containers with secrethub"
                );
                Ok(res.with_patch(patch)?)
            }
            Ok(None) => {
                tracing::debug!({ pod = name, namespace = namespace }, "pod not selected for secrethub");
                Ok(res)
            }
            Err(err) => {
                tracing::error!(
                    { pod = name, namespace = namespace, err = &err as &dyn StdError },
                    "failed to mutate pod"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::{MutatorConfig, TargetPolicy};
    use kube::core::admission::AdmissionReview;
    use serde_json::{Value, json};

    fn request(kind: &str, object: Value) -> AdmissionRequest<DynamicObject> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "3c1a4a7e-6e0f-4c4b-9a4e-8f3a3d1b2c10",
                "kind": { "group": "", "version": "v1", "kind": kind },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {},
                "object": object
            }
        });

        let review: AdmissionReview<DynamicObject> = serde_json::from_value(review).unwrap();
        review.try_into().unwrap()
    }

    fn pod_object(annotations: Value, containers: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "generateName": "api-",
                "namespace": "default",
                "annotations": annotations
            },
            "spec": { "containers": containers }
        })
    }

    fn operations(res: &AdmissionResponse) -> JsonPatch {
        let bytes = res.patch.as_ref().expect("response carries a patch");
        serde_json::from_slice(bytes).unwrap()
    }

    fn apply_raw(object: &Value, res: &AdmissionResponse) -> Value {
        let mut doc = object.clone();
        json_patch::patch(&mut doc, &operations(res).0).unwrap();
        doc
    }

    fn apply(object: &Value, res: &AdmissionResponse) -> Pod {
        serde_json::from_value(apply_raw(object, res)).unwrap()
    }

    #[tokio::test]
    async fn patches_annotated_pod() {
        let handler = SecretHubMutator::new(Mutator::default());
        let object = pod_object(
            json!({ "secrethub.io/mutate": "app", "secrethub.io/version": "0.38.0" }),
            json!([
                { "name": "app", "image": "nginx", "command": ["foo"] },
                { "name": "app2", "image": "nginx", "command": ["bar"] }
            ]),
        );

        let res = handler.mutate(&request("Pod", object.clone())).await.unwrap();
        assert!(res.allowed);

        let pod = apply(&object, &res);
        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.containers[0].command.as_deref().unwrap(),
            ["/secrethub/bin/secrethub", "run", "--", "foo"]
        );
        assert_eq!(spec.containers[1].command.as_deref().unwrap(), ["bar"]);

        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].image.as_deref(), Some("secrethub/cli:0.38.0"));
        assert_eq!(spec.volumes.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prepends_copy_container_before_existing_init_containers() {
        let handler = SecretHubMutator::new(Mutator::default());
        let mut object = pod_object(
            json!({ "secrethub.io/mutate": "migrate,app" }),
            json!([{ "name": "app", "image": "nginx", "command": ["serve"] }]),
        );
        object["spec"]["initContainers"] =
            json!([{ "name": "migrate", "image": "migrate", "command": ["up"] }]);

        let res = handler.mutate(&request("Pod", object.clone())).await.unwrap();
        let init = apply(&object, &res).spec.unwrap().init_containers.unwrap();

        let names: Vec<_> = init.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["copy-secrethub-bin", "migrate"]);
        assert_eq!(
            init[1].command.as_deref().unwrap(),
            ["/secrethub/bin/secrethub", "run", "--", "up"]
        );
    }

    #[tokio::test]
    async fn keeps_unknown_fields_of_existing_init_containers() {
        let handler = SecretHubMutator::new(Mutator::default());
        let mut object = pod_object(
            json!({ "secrethub.io/mutate": "app" }),
            json!([{ "name": "app", "image": "nginx", "command": ["serve"], "futureField": "keep" }]),
        );
        object["spec"]["initContainers"] = json!([{
            "name": "migrate",
            "image": "m",
            "command": ["up"],
            "futureField": { "x": 1 }
        }]);

        let res = handler.mutate(&request("Pod", object.clone())).await.unwrap();
        let doc = apply_raw(&object, &res);

        let init = doc["spec"]["initContainers"].as_array().unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[0]["name"], "copy-secrethub-bin");
        assert!(init[0].get("futureField").is_none());
        assert_eq!(init[1]["name"], "migrate");
        assert_eq!(init[1]["command"], json!(["up"]));
        assert_eq!(init[1]["futureField"], json!({ "x": 1 }));

        let app = &doc["spec"]["containers"][0];
        assert_eq!(app["futureField"], "keep");
        assert_eq!(app["command"], json!(["/secrethub/bin/secrethub", "run", "--", "serve"]));
    }

    #[tokio::test]
    async fn patch_only_touches_mutated_fields() {
        let handler = SecretHubMutator::new(Mutator::new(MutatorConfig {
            inject_app_info: true,
            ..Default::default()
        }));
        let mut object = pod_object(
            json!({ "secrethub.io/mutate": "app" }),
            json!([{
                "name": "app",
                "image": "nginx",
                "command": ["serve"],
                "env": [{ "name": "MODE", "value": "prod" }],
                "volumeMounts": [{ "name": "data", "mountPath": "/data" }]
            }]),
        );
        object["spec"]["volumes"] = json!([{ "name": "data", "emptyDir": {} }]);

        let res = handler.mutate(&request("Pod", object.clone())).await.unwrap();
        let paths: Vec<_> = operations(&res)
            .0
            .iter()
            .map(|op| match op {
                PatchOperation::Add(op) => format!("add {}", op.path),
                PatchOperation::Replace(op) => format!("replace {}", op.path),
                other => panic!("unexpected operation {other:?}"),
            })
            .collect();
        assert_eq!(
            paths,
            [
                "replace /spec/containers/0/command",
                "add /spec/containers/0/volumeMounts/-",
                "add /spec/containers/0/env/-",
                "add /spec/containers/0/env/-",
                "add /spec/initContainers",
                "add /spec/volumes/-",
            ]
        );

        let spec = apply(&object, &res).spec.unwrap();
        let env: Vec<_> = spec.containers[0]
            .env
            .iter()
            .flatten()
            .map(|env| env.name.as_str())
            .collect();
        assert_eq!(env, ["MODE", "SECRETHUB_APP_INFO_NAME", "SECRETHUB_APP_INFO_VERSION"]);
        let volumes: Vec<_> = spec.volumes.iter().flatten().map(|v| v.name.as_str()).collect();
        assert_eq!(volumes, ["data", "secrethub-bin"]);
    }

    #[tokio::test]
    async fn leaves_unannotated_pod_alone() {
        let handler = SecretHubMutator::new(Mutator::default());
        let object = pod_object(
            json!({ "unrelated": "value" }),
            json!([{ "name": "app", "image": "nginx", "command": ["foo"] }]),
        );

        let res = handler.mutate(&request("Pod", object)).await.unwrap();
        assert!(res.allowed);
        assert!(res.patch.is_none());
    }

    #[tokio::test]
    async fn ignores_other_kinds() {
        let handler = SecretHubMutator::new(Mutator::default());
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "annotations": { "secrethub.io/mutate": "app" }
            },
            "data": {}
        });

        let res = handler.mutate(&request("ConfigMap", object)).await.unwrap();
        assert!(res.allowed);
        assert!(res.patch.is_none());
    }

    #[tokio::test]
    async fn fails_on_container_without_command() {
        let handler = SecretHubMutator::new(Mutator::new(MutatorConfig {
            policy: TargetPolicy::SecretReferences,
            ..Default::default()
        }));
        let object = pod_object(
            json!({ "secrethub.io/mutate": "" }),
            json!([{
                "name": "foo",
                "image": "nginx",
                "env": [{ "name": "API_KEY", "value": "secrethub://path/to/api/key" }]
            }]),
        );

        let err = handler
            .mutate(&request("Pod", object))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "not attaching SecretHub to the container foo: the podspec does not define a command"
        );
    }

    #[test]
    fn no_patch_when_nothing_selected() {
        let handler = SecretHubMutator::new(Mutator::default());
        let pod: Pod = serde_json::from_value(pod_object(
            json!({ "secrethub.io/mutate": "other" }),
            json!([{ "name": "app", "command": ["foo"] }]),
        ))
        .unwrap();

        assert!(handler.patch(&pod).unwrap().is_none());
    }
}
