#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use keda_manager::cluster::Cluster;
use keda_manager::crd::{Keda, KedaSpec, KedaStatus};
use keda_manager::events::{EventPublisher, StateEvent};
use keda_manager::manifest::{kind_of, name_of, parse_manifest};
use keda_manager::reconciler::{Fsm, ReconcilerConfig};
use kube::api::DynamicObject;
use serde_json::Value;

pub const NAMESPACE: &str = "kyma-system";
pub const NAME: &str = "default";
pub const OPERATOR: &str = "keda-operator";
pub const METRICS_SERVER: &str = "keda-operator-metrics-apiserver";

/// (kind, namespace, name)
pub type Key = (String, String, String);

fn key_of(object: &DynamicObject) -> Key {
    (
        kind_of(object).to_string(),
        object.metadata.namespace.clone().unwrap_or_default(),
        name_of(object).to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    kedas: BTreeMap<(String, String), Keda>,
    ready: BTreeSet<String>,
    mutations: usize,
    applied: Vec<Key>,
    deleted: Vec<Key>,
    status_writes: Vec<KedaStatus>,
    fail_apply_kind: Option<String>,
    linger: bool,
    lingering: BTreeSet<Key>,
    hang_reads: bool,
}

/// A [`Cluster`] that keeps everything in memory.
///
/// It counts a mutation only when a write actually changes what is stored,
/// so a second identical pass can be checked for being a no-op.
#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn with_keda(keda: Keda) -> Arc<Self> {
        let cluster = MemoryCluster::default();
        cluster.put_keda(keda);
        Arc::new(cluster)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn put_keda(&self, keda: Keda) {
        let key = (
            keda.metadata.namespace.clone().unwrap_or_default(),
            keda.metadata.name.clone().unwrap_or_default(),
        );
        self.lock().kedas.insert(key, keda);
    }

    /// The stored `Keda`, as the controller would hand it to a pass.
    pub fn keda(&self) -> Keda {
        self.try_keda().expect("keda resource is stored")
    }

    pub fn try_keda(&self) -> Option<Keda> {
        self.lock().kedas.values().next().cloned()
    }

    pub fn edit_keda(&self, edit: impl FnOnce(&mut Keda)) {
        let mut keda = self.keda();
        edit(&mut keda);
        self.put_keda(keda);
    }

    pub fn mark_for_deletion(&self) {
        self.edit_keda(|k| {
            k.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        });
    }

    pub fn object(&self, kind: &str, name: &str) -> Option<DynamicObject> {
        self.lock()
            .objects
            .values()
            .find(|o| kind_of(o) == kind && name_of(o) == name)
            .cloned()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|o| kind_of(o) == kind)
            .count()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    pub fn applied(&self) -> Vec<Key> {
        self.lock().applied.clone()
    }

    pub fn deleted(&self) -> Vec<Key> {
        self.lock().deleted.clone()
    }

    pub fn status_writes(&self) -> Vec<KedaStatus> {
        self.lock().status_writes.clone()
    }

    pub fn set_ready(&self, deployment: &str, ready: bool) {
        let mut inner = self.lock();
        if ready {
            inner.ready.insert(deployment.to_string());
        } else {
            inner.ready.remove(deployment);
        }
    }

    pub fn fail_apply_of(&self, kind: &str) {
        self.lock().fail_apply_kind = Some(kind.to_string());
    }

    /// Deleted objects stay visible until [`MemoryCluster::release`] is called.
    pub fn linger_deletes(&self, linger: bool) {
        self.lock().linger = linger;
    }

    /// Deployment reads never complete.
    pub fn hang_reads(&self) {
        self.lock().hang_reads = true;
    }

    pub fn release(&self) {
        let mut inner = self.lock();
        let lingering = std::mem::take(&mut inner.lingering);
        for key in lingering {
            inner.objects.remove(&key);
        }
    }
}

#[async_trait::async_trait]
impl Cluster for MemoryCluster {
    async fn apply(&self, object: &DynamicObject) -> Result<(), kube::Error> {
        let mut inner = self.lock();
        if inner.fail_apply_kind.as_deref() == Some(kind_of(object)) {
            return Err(api_error(
                500,
                "InternalError",
                format!("cannot apply {}", name_of(object)),
            ));
        }
        let key = key_of(object);
        inner.applied.push(key.clone());
        let unchanged = inner
            .objects
            .get(&key)
            .map(|stored| serde_json::to_value(stored).ok() == serde_json::to_value(object).ok())
            .unwrap_or(false);
        if !unchanged {
            inner.objects.insert(key, object.clone());
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn exists(&self, object: &DynamicObject) -> Result<bool, kube::Error> {
        Ok(self.lock().objects.contains_key(&key_of(object)))
    }

    async fn delete(&self, object: &DynamicObject) -> Result<(), kube::Error> {
        let mut inner = self.lock();
        let key = key_of(object);
        if !inner.objects.contains_key(&key) {
            return Ok(());
        }
        inner.deleted.push(key.clone());
        if inner.linger {
            if inner.lingering.insert(key) {
                inner.mutations += 1;
            }
        } else {
            inner.objects.remove(&key);
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, kube::Error> {
        let hang = self.lock().hang_reads;
        if hang {
            std::future::pending::<()>().await;
        }
        let inner = self.lock();
        let key = (
            "Deployment".to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        let stored = match inner.objects.get(&key) {
            Some(stored) => stored,
            None => return Ok(None),
        };
        let mut deployment: Deployment = serde_json::to_value(stored)
            .and_then(serde_json::from_value)
            .map_err(kube::Error::SerdeError)?;
        if inner.ready.contains(name) {
            let replicas = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1);
            deployment.status = Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                available_replicas: Some(replicas),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
        Ok(Some(deployment))
    }

    async fn patch_status(&self, keda: &Keda, status: &KedaStatus) -> Result<(), kube::Error> {
        let mut inner = self.lock();
        let key = (
            keda.metadata.namespace.clone().unwrap_or_default(),
            keda.metadata.name.clone().unwrap_or_default(),
        );
        let stored = inner
            .kedas
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound", "keda not found".to_string()))?;
        stored.status = Some(status.clone());
        inner.status_writes.push(status.clone());
        inner.mutations += 1;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        keda: &Keda,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let mut inner = self.lock();
        let key = (
            keda.metadata.namespace.clone().unwrap_or_default(),
            keda.metadata.name.clone().unwrap_or_default(),
        );
        let stored = inner
            .kedas
            .get_mut(&key)
            .ok_or_else(|| api_error(404, "NotFound", "keda not found".to_string()))?;
        let current = stored.metadata.finalizers.clone().unwrap_or_default();
        if current != keda.metadata.finalizers.clone().unwrap_or_default() {
            return Err(api_error(409, "Conflict", "finalizers changed".to_string()));
        }
        let released = finalizers.is_empty() && stored.metadata.deletion_timestamp.is_some();
        stored.metadata.finalizers = Some(finalizers);
        if released {
            inner.kedas.remove(&key);
        }
        inner.mutations += 1;
        Ok(())
    }
}

/// Keeps every published event with the name of the object it is about.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, StateEvent)>>,
}

impl RecordingEvents {
    pub fn all(&self) -> Vec<(String, StateEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.all().into_iter().map(|(_, e)| e.reason).collect()
    }
}

#[async_trait::async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(&self, regarding: &ObjectReference, event: StateEvent) {
        let name = regarding.name.clone().unwrap_or_default();
        self.events.lock().unwrap().push((name, event));
    }
}

pub fn template() -> Vec<DynamicObject> {
    parse_manifest(include_str!("../fixtures/keda.yaml")).expect("fixture manifest parses")
}

pub fn keda(spec: KedaSpec) -> Keda {
    keda_in(NAMESPACE, spec)
}

pub fn keda_in(namespace: &str, spec: KedaSpec) -> Keda {
    let mut keda = Keda::new(NAME, spec);
    keda.metadata.namespace = Some(namespace.to_string());
    keda.metadata.uid = Some("3a6d1a4e-0c59-4f3e-9d1c-2b8f1e7a0c11".to_string());
    keda.metadata.generation = Some(1);
    keda
}

pub fn fsm(cluster: &Arc<MemoryCluster>) -> Fsm {
    fsm_with(cluster, template())
}

pub fn fsm_with(cluster: &Arc<MemoryCluster>, template: Vec<DynamicObject>) -> Fsm {
    let cluster: Arc<dyn Cluster> = cluster.clone();
    Fsm::new(cluster, Arc::new(template), ReconcilerConfig::default())
}

/// Container 0 of a deployment as plain JSON.
pub fn container(deployment: &DynamicObject) -> Value {
    deployment.data["spec"]["template"]["spec"]["containers"][0].clone()
}

pub fn args(deployment: &DynamicObject) -> Vec<String> {
    serde_json::from_value(container(deployment)["args"].clone()).unwrap_or_default()
}

pub fn env(deployment: &DynamicObject) -> Vec<(String, Option<String>)> {
    container(deployment)["env"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|e| {
                    (
                        e["name"].as_str().unwrap_or_default().to_string(),
                        e["value"].as_str().map(str::to_string),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn template_deployment(name: &str) -> DynamicObject {
    template()
        .into_iter()
        .find(|o| kind_of(o) == "Deployment" && name_of(o) == name)
        .expect("fixture contains the deployment")
}
