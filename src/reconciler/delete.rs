//! Teardown of an installation whose `Keda` resource is being deleted.
//!
//! Objects are removed workloads first and shared definitions last, so
//! nothing running ever loses the RBAC or CRDs it depends on. The finalizer
//! is released only after the API confirms every object is gone.

use kube::api::DynamicObject;
use statefn::Directive;
use tracing::{debug, info};

use super::stage::Stage;
use super::state::SystemState;
use super::{fail, Fsm, StageResult, FINALIZER};
use crate::error::Error;
use crate::manifest::{kind_of, name_of};
use crate::status::{CONDITION_TYPE_DELETED, REASON_DELETED, REASON_DELETION, REASON_DELETION_ERR};

fn deletion_rank(kind: &str) -> u8 {
    match kind {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Job" | "CronJob" => 0,
        "APIService" | "ValidatingWebhookConfiguration" | "MutatingWebhookConfiguration" => 1,
        "Service" => 2,
        "RoleBinding" | "ClusterRoleBinding" => 3,
        "Role" | "ClusterRole" => 4,
        "ServiceAccount" => 5,
        "CustomResourceDefinition" => 7,
        _ => 6,
    }
}

/// The working set in the order it is torn down. Ties keep render order.
pub fn deletion_order(objects: &[DynamicObject]) -> Vec<&DynamicObject> {
    let mut ordered: Vec<&DynamicObject> = objects.iter().collect();
    ordered.sort_by_key(|o| deletion_rank(kind_of(o)));
    ordered
}

fn has_finalizer(state: &SystemState) -> bool {
    state
        .instance
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == FINALIZER)
}

pub(super) async fn sfn_delete(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    if !has_finalizer(state) {
        debug!("Finalizer already released, nothing to tear down");
        return StageResult::done();
    }

    state
        .instance
        .update_state_deletion(REASON_DELETION, "deleting installed objects");

    let mut failure = None;
    for object in deletion_order(&state.objects) {
        if let Err(source) = fsm.cluster.delete(object).await {
            failure = Some(Error::Delete {
                kind: kind_of(object).to_string(),
                name: name_of(object).to_string(),
                source,
            });
            break;
        }
    }
    if let Some(error) = failure {
        return deletion_failed(state, error);
    }
    StageResult::next(Stage::VerifyDeletion)
}

pub(super) async fn sfn_verify_deletion(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    let mut remaining = Vec::new();
    let mut failure = None;
    for object in deletion_order(&state.objects) {
        match fsm.cluster.exists(object).await {
            Ok(false) => {}
            Ok(true) => remaining.push(format!("{}/{}", kind_of(object), name_of(object))),
            Err(source) => {
                failure = Some(Error::Delete {
                    kind: kind_of(object).to_string(),
                    name: name_of(object).to_string(),
                    source,
                });
                break;
            }
        }
    }
    if let Some(error) = failure {
        return deletion_failed(state, error);
    }

    if remaining.is_empty() {
        return StageResult::next(Stage::RemoveFinalizer);
    }

    debug!(?remaining, "Waiting for objects to be removed");
    state.instance.update_state_deletion(
        REASON_DELETION,
        format!("waiting for removal of {}", remaining.join(", ")),
    );
    state.directive = Directive::RequeueAfter(fsm.config.ready_poll_interval);
    StageResult::next(Stage::UpdateStatus)
}

pub(super) async fn sfn_remove_finalizer(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    state.instance.update_state_ready(
        CONDITION_TYPE_DELETED,
        REASON_DELETED,
        "all installed objects removed",
    );
    if let Err(e) = fsm.persist_status(state).await {
        return fail(e);
    }

    let finalizers: Vec<String> = state
        .instance
        .metadata
        .finalizers
        .iter()
        .flatten()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    if let Err(e) = fsm
        .cluster
        .set_finalizers(&state.instance, finalizers)
        .await
    {
        return deletion_failed(state, Error::Kube(e));
    }

    info!("Released finalizer");
    StageResult::done()
}

fn deletion_failed(state: &mut SystemState, error: Error) -> StageResult {
    state
        .instance
        .update_state_from_err(CONDITION_TYPE_DELETED, REASON_DELETION_ERR, &error);
    fail(error)
}
