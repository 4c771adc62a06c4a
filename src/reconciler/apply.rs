use kube::api::DynamicObject;
use tracing::debug;

use super::stage::Stage;
use super::state::{SystemState, Target};
use super::{fail, Fsm, StageResult};
use crate::cluster::Cluster;
use crate::error::{Error, PatchError};
use crate::manifest::{kind_of, name_of};
use crate::status::{
    CONDITION_TYPE_INSTALLED, REASON_APPLY_OBJ_ERROR, REASON_DEPLOYMENT_UPDATE_ERR,
};

/// Apply every rendered object except the two targets, which are applied
/// only once all patches have run.
///
/// Both targets must be part of the rendered set, otherwise nothing is applied.
pub(super) async fn sfn_apply_manifest(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    for target in [Target::Operator, Target::MetricsServer] {
        let name = fsm.config.deployment_name(target);
        if state.object(super::DEPLOYMENT_KIND, name).is_none() {
            let error = Error::Patch(PatchError::TargetMissing(name.to_string()));
            state.instance.update_state_from_err(
                CONDITION_TYPE_INSTALLED,
                REASON_DEPLOYMENT_UPDATE_ERR,
                &error,
            );
            return fail(error);
        }
    }

    let objects = state.objects.iter().filter(|o| !fsm.is_target(o));
    if let Err(e) = apply_all(fsm.cluster.as_ref(), objects).await {
        return apply_failed(state, e);
    }
    StageResult::next(Stage::OperatorLogging)
}

/// Apply the patched target deployments.
pub(super) async fn sfn_apply_patched(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    let targets = state.objects.iter().filter(|o| fsm.is_target(o));
    if let Err(e) = apply_all(fsm.cluster.as_ref(), targets).await {
        return apply_failed(state, e);
    }
    debug!(changed = ?state.changed, "Applied target deployments");
    StageResult::next(Stage::Verify)
}

async fn apply_all<'a>(
    cluster: &dyn Cluster,
    objects: impl Iterator<Item = &'a DynamicObject>,
) -> Result<(), Error> {
    for object in objects {
        cluster
            .apply(object)
            .await
            .map_err(|source| Error::Apply {
                kind: kind_of(object).to_string(),
                name: name_of(object).to_string(),
                source,
            })?;
    }
    Ok(())
}

fn apply_failed(state: &mut SystemState, error: Error) -> StageResult {
    state
        .instance
        .update_state_from_err(CONDITION_TYPE_INSTALLED, REASON_APPLY_OBJ_ERROR, &error);
    fail(error)
}
