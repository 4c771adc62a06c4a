//! The handle the reconciler uses to talk to the cluster.
//!
//! Every call is a single request; nothing here retries or caches. Conflicts
//! and other API errors are handed back to the caller unchanged.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
    PropagationPolicy,
};
use kube::{Client, Resource};
use tracing::{debug, instrument};

use crate::crd::{Keda, KedaStatus};
use crate::error::is_not_found;
use crate::manifest::{is_cluster_scoped, kind_of, name_of, MANAGER_NAME};

/// Every cluster call the reconciler makes.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Create or update `object` with server-side apply.
    async fn apply(&self, object: &DynamicObject) -> Result<(), kube::Error>;

    /// Whether `object` still exists.
    async fn exists(&self, object: &DynamicObject) -> Result<bool, kube::Error>;

    /// Delete `object`. An object that is already gone is not an error.
    async fn delete(&self, object: &DynamicObject) -> Result<(), kube::Error>;

    /// The deployment `namespace/name`, `None` when it does not exist.
    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error>;

    /// Replace the status of `keda` in one write.
    async fn patch_status(&self, keda: &Keda, status: &KedaStatus) -> Result<(), kube::Error>;

    /// Replace the finalizers of `keda`, failing if they changed since it was read.
    async fn set_finalizers(&self, keda: &Keda, finalizers: Vec<String>)
        -> Result<(), kube::Error>;
}

/// [`Cluster`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Use `client` for every call.
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    fn dynamic_api(&self, object: &DynamicObject) -> Api<DynamicObject> {
        let (group, version) = match object.types.as_ref() {
            Some(types) => match types.api_version.split_once('/') {
                Some((group, version)) => (group.to_string(), version.to_string()),
                None => (String::new(), types.api_version.clone()),
            },
            None => (String::new(), String::new()),
        };
        let kind = kind_of(object);
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(&group, &version, kind));
        match object.metadata.namespace.as_deref() {
            Some(namespace) if !is_cluster_scoped(kind) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn keda_api(&self, keda: &Keda) -> Api<Keda> {
        match keda.meta().namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    #[instrument(
        level = "debug",
        skip(self, object),
        fields(kind = kind_of(object), name = name_of(object))
    )]
    async fn apply(&self, object: &DynamicObject) -> Result<(), kube::Error> {
        let params = PatchParams::apply(MANAGER_NAME).force();
        self.dynamic_api(object)
            .patch(name_of(object), &params, &Patch::Apply(object))
            .await?;
        debug!("Applied object");
        Ok(())
    }

    async fn exists(&self, object: &DynamicObject) -> Result<bool, kube::Error> {
        match self.dynamic_api(object).get(name_of(object)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(
        level = "debug",
        skip(self, object),
        fields(kind = kind_of(object), name = name_of(object))
    )]
    async fn delete(&self, object: &DynamicObject) -> Result<(), kube::Error> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.dynamic_api(object).delete(name_of(object), &params).await {
            Ok(_) => {
                debug!("Deleted object");
                Ok(())
            }
            // Ignore not found, already deleted.
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn patch_status(&self, keda: &Keda, status: &KedaStatus) -> Result<(), kube::Error> {
        let name = keda.meta().name.clone().unwrap_or_default();
        let patch = serde_json::json!({ "status": status });
        debug!(%name, "Patching keda status");
        self.keda_api(keda)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        keda: &Keda,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let name = keda.meta().name.clone().unwrap_or_default();
        let (ops, guarded) = match keda.meta().finalizers.as_ref() {
            // The test op makes the write fail if the list changed since `keda` was read.
            Some(current) if !current.is_empty() => (
                serde_json::json!([
                    { "op": "test", "path": "/metadata/finalizers", "value": current },
                    { "op": "replace", "path": "/metadata/finalizers", "value": finalizers },
                ]),
                true,
            ),
            _ => (
                serde_json::json!([
                    { "op": "add", "path": "/metadata/finalizers", "value": finalizers },
                ]),
                false,
            ),
        };
        let patch: json_patch::Patch =
            serde_json::from_value(ops).map_err(kube::Error::SerdeError)?;
        debug!(%name, ?finalizers, "Replacing keda finalizers");
        match self
            .keda_api(keda)
            .patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if guarded => Err(failed_test_as_conflict(e)),
            Err(e) => Err(e),
        }
    }
}

/// The apiserver answers a failed JSON patch `test` op with 422. For a
/// guarded finalizer write that means another writer got there first.
fn failed_test_as_conflict(error: kube::Error) -> kube::Error {
    match error {
        kube::Error::Api(mut response) if response.code == 422 => {
            response.code = 409;
            response.reason = "Conflict".to_string();
            kube::Error::Api(response)
        }
        other => other,
    }
}
