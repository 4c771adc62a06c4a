//! Loads the manifest bundle and renders it for one `Keda` resource.
//!
//! The bundle is parsed once at startup. Rendering is pure: it deep-copies the
//! template and stamps namespace, owner reference and labels on every object,
//! so the same resource always renders to the same objects. References from
//! one bundle object to another (binding subjects, webhook and APIService
//! backends) are moved to the resource's namespace along with their targets.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::Resource;
use serde::Deserialize;
use serde_json::Value;

use crate::crd::Keda;
use crate::error::{ManifestError, RenderError};

/// Set to [`MANAGER_NAME`] on every rendered object.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Set to the name of the owning `Keda` on every rendered object.
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Field manager, label value and event reporter.
pub const MANAGER_NAME: &str = "keda-manager";

/// Kinds that live outside any namespace and so cannot be owned by a `Keda`.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PriorityClass",
    "ValidatingWebhookConfiguration",
];

/// Parse a multi-document YAML bundle into objects.
///
/// Empty documents are skipped and `List` documents contribute their items.
pub fn parse_manifest(data: &str) -> Result<Vec<DynamicObject>, ManifestError> {
    let mut objects = vec![];
    for (index, document) in serde_yaml::Deserializer::from_str(data).enumerate() {
        let value = serde_json::Value::deserialize(document)
            .map_err(|source| ManifestError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }
        let values = match value.get("kind").and_then(|k| k.as_str()) {
            Some("List") => value
                .get("items")
                .and_then(|items| items.as_array())
                .cloned()
                .unwrap_or_default(),
            _ => vec![value],
        };
        for value in values {
            let object = serde_json::from_value(value)
                .map_err(|source| ManifestError::Object { index, source })?;
            objects.push(object);
        }
    }
    Ok(objects)
}

/// Read and parse the manifest bundle at `path`.
pub async fn load_manifest(path: &Path) -> Result<Vec<DynamicObject>, ManifestError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
    parse_manifest(&data)
}

/// `kind` of `object`, empty when it has no type information.
pub fn kind_of(object: &DynamicObject) -> &str {
    object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

/// `metadata.name` of `object`, empty when unset.
pub fn name_of(object: &DynamicObject) -> &str {
    object.metadata.name.as_deref().unwrap_or("")
}

/// Whether objects of `kind` live outside any namespace.
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Where and for whom a bundle is rendered.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderContext {
    /// Namespace of the `Keda`, and of every namespaced object.
    pub namespace: String,
    /// Name of the `Keda`.
    pub instance: String,
    /// Controller reference to the `Keda`.
    pub owner: OwnerReference,
}

impl RenderContext {
    /// The context for rendering on behalf of `keda`.
    pub fn from_keda(keda: &Keda) -> Result<Self, RenderError> {
        let meta = keda.meta();
        let namespace = meta
            .namespace
            .clone()
            .ok_or(RenderError::MissingOwner("a namespace"))?;
        let instance = meta
            .name
            .clone()
            .ok_or(RenderError::MissingOwner("a name"))?;
        let uid = meta.uid.clone().ok_or(RenderError::MissingOwner("a uid"))?;
        Ok(RenderContext {
            namespace,
            owner: OwnerReference {
                api_version: Keda::api_version(&()).to_string(),
                kind: Keda::kind(&()).to_string(),
                name: instance.clone(),
                uid,
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            instance,
        })
    }
}

/// Render `template` for the resource described by `ctx`.
pub fn render(
    template: &[DynamicObject],
    ctx: &RenderContext,
) -> Result<Vec<DynamicObject>, RenderError> {
    if template.is_empty() {
        return Err(RenderError::Empty);
    }

    template
        .iter()
        .enumerate()
        .map(|(index, object)| render_object(index, object, ctx))
        .collect()
}

fn render_object(
    index: usize,
    object: &DynamicObject,
    ctx: &RenderContext,
) -> Result<DynamicObject, RenderError> {
    let malformed = |reason: &str| RenderError::Malformed {
        index,
        reason: reason.to_string(),
    };
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| malformed("missing apiVersion and kind"))?;
    if types.api_version.is_empty() {
        return Err(malformed("missing apiVersion"));
    }
    if types.kind.is_empty() {
        return Err(malformed("missing kind"));
    }
    if object.metadata.name.as_deref().unwrap_or("").is_empty() {
        return Err(malformed("missing metadata.name"));
    }

    let mut rendered = object.clone();
    let meta = &mut rendered.metadata;
    if is_cluster_scoped(&types.kind) {
        meta.namespace = None;
    } else {
        meta.namespace = Some(ctx.namespace.clone());
        meta.owner_references = Some(vec![ctx.owner.clone()]);
    }

    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_INSTANCE.to_string(), ctx.instance.clone());

    retarget_references(&types.kind, &mut rendered.data, &ctx.namespace);
    Ok(rendered)
}

/// Point references to other bundle objects at `namespace`.
fn retarget_references(kind: &str, data: &mut Value, namespace: &str) {
    match kind {
        "RoleBinding" | "ClusterRoleBinding" => {
            let subjects = data.get_mut("subjects").and_then(Value::as_array_mut);
            for subject in subjects.into_iter().flatten() {
                if subject["kind"].as_str() == Some("ServiceAccount") {
                    set_namespace(Some(subject), namespace);
                }
            }
        }
        "APIService" => set_namespace(data.pointer_mut("/spec/service"), namespace),
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => {
            let webhooks = data.get_mut("webhooks").and_then(Value::as_array_mut);
            for webhook in webhooks.into_iter().flatten() {
                set_namespace(webhook.pointer_mut("/clientConfig/service"), namespace);
            }
        }
        "CustomResourceDefinition" => set_namespace(
            data.pointer_mut("/spec/conversion/webhook/clientConfig/service"),
            namespace,
        ),
        _ => {}
    }
}

fn set_namespace(reference: Option<&mut Value>, namespace: &str) {
    if let Some(Value::Object(fields)) = reference {
        fields.insert("namespace".to_string(), Value::String(namespace.to_string()));
    }
}
