//! Hooks the reconciler into a `kube_runtime` controller.
//!
//! The controller owns scheduling: one pass per `Keda` at a time, new passes
//! whenever the resource or one of the deployments it owns changes, retries
//! with backoff when a pass fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use kube_runtime::controller::{Context, Controller, ReconcilerAction};
use statefn::Directive;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffMap;
use crate::crd::Keda;
use crate::error::Error;
use crate::manifest::{LABEL_MANAGED_BY, MANAGER_NAME};
use crate::metrics::{Metrics, ReconcileLabels};
use crate::reconciler::{Fsm, SystemState};
use crate::server::Health;

const CONFLICT_RETRY: Duration = Duration::from_secs(1);

/// Data shared by every reconciliation.
pub struct Data {
    fsm: Fsm,
    backoff: BackoffMap,
    metrics: Arc<Metrics>,
}

impl Data {
    /// Context for reconciling with `fsm`, reporting into `metrics`.
    pub fn new(fsm: Fsm, metrics: Arc<Metrics>) -> Self {
        Data {
            fsm,
            backoff: BackoffMap::default(),
            metrics,
        }
    }
}

/// A failed pass, tagged with the object it belongs to.
#[derive(Debug, thiserror::Error)]
#[error("reconciling {key} failed: {source}")]
pub struct ReconcileError {
    key: String,
    #[source]
    source: Error,
}

impl ReconcileError {
    /// `namespace/name` of the resource.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// What ended the pass.
    pub fn error(&self) -> &Error {
        &self.source
    }
}

fn object_key(keda: &Keda) -> String {
    format!("{}/{}", keda.namespace().unwrap_or_default(), keda.name())
}

/// Translate a directive into the action `kube_runtime` understands.
pub fn action(directive: Directive) -> ReconcilerAction {
    let requeue_after = match directive {
        Directive::Done => None,
        Directive::Requeue => Some(Duration::from_secs(0)),
        Directive::RequeueAfter(after) => Some(after),
    };
    ReconcilerAction { requeue_after }
}

#[instrument(skip(keda, ctx), fields(namespace = ?keda.namespace(), name = %keda.name()))]
async fn reconcile(keda: Keda, ctx: Context<Data>) -> Result<ReconcilerAction, ReconcileError> {
    let data = ctx.get_ref();
    let key = object_key(&keda);
    let labels = ReconcileLabels {
        namespace: keda.namespace().unwrap_or_default(),
        name: keda.name(),
    };

    let started = Instant::now();
    let result = data.fsm.run(SystemState::new(keda)).await;
    data.metrics
        .record_reconcile(&labels, started.elapsed().as_secs_f64());

    match result {
        Ok((directive, state)) => {
            if state.deleting() && directive == Directive::Done {
                // The finalizer is gone, so is the resource.
                data.metrics.forget_state(&labels);
            } else if let Some(current) = state.instance.state() {
                data.metrics.set_state(&labels, &current.to_string());
            }
            data.backoff.reset(&key);
            debug!(?directive, changed = ?state.changed, "Reconciliation finished");
            Ok(action(directive))
        }
        Err(source) => {
            data.metrics.record_error(&labels);
            Err(ReconcileError { key, source })
        }
    }
}

fn error_policy(error: &ReconcileError, ctx: Context<Data>) -> ReconcilerAction {
    if !error.source.requeue() {
        warn!(key = %error.key, error = %error.source, "Reconciliation failed, not retrying");
        return ReconcilerAction {
            requeue_after: None,
        };
    }
    if error.source.is_conflict() {
        // Lost a race, the next pass reads the newer object.
        debug!(key = %error.key, "Conflicting write, retrying without backoff");
        return ReconcilerAction {
            requeue_after: Some(CONFLICT_RETRY),
        };
    }
    let delay = ctx.get_ref().backoff.next_duration(&error.key);
    warn!(key = %error.key, error = %error.source, ?delay, "Reconciliation failed, retrying");
    ReconcilerAction {
        requeue_after: Some(delay),
    }
}

/// Watch `Keda` resources and reconcile them until the watch ends.
pub async fn run(client: Client, fsm: Fsm, metrics: Arc<Metrics>, health: Arc<Health>) {
    let kedas: Api<Keda> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);
    let owned = ListParams::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGER_NAME));

    info!("Starting keda controller");
    health.set_ready(true);
    Controller::new(kedas, ListParams::default())
        .owns(deployments, owned)
        .run(reconcile, error_policy, Context::new(Data::new(fsm, metrics)))
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!(name = %object.name, "Reconciled"),
                Err(e) => debug!(error = %e, "Reconcile attempt ended with error"),
            }
        })
        .await;
    health.set_ready(false);
    info!("Keda controller stopped");
}
