use tracing::{debug, info};

use super::stage::Stage;
use super::state::SystemState;
use super::{fail, Fsm, StageResult, FINALIZER};
use crate::error::Error;
use crate::manifest::{render, RenderContext};
use crate::status::{
    CONDITION_TYPE_DELETED, CONDITION_TYPE_INSTALLED, REASON_DELETION_ERR, REASON_INITIALIZED,
    REASON_RENDER_ERR,
};

/// Make sure the resource carries our finalizer and a first condition.
pub(super) async fn sfn_initialize(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    if state.deleting() {
        return StageResult::next(Stage::Render);
    }

    let mut finalizers = state.instance.metadata.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == FINALIZER) {
        finalizers.push(FINALIZER.to_string());
        if let Err(e) = fsm
            .cluster
            .set_finalizers(&state.instance, finalizers.clone())
            .await
        {
            state.instance.update_state_processing(
                CONDITION_TYPE_INSTALLED,
                REASON_INITIALIZED,
                format!("unable to add finalizer: {}", e),
            );
            return fail(Error::Kube(e));
        }
        info!("Added finalizer");
        state.instance.metadata.finalizers = Some(finalizers);
    }

    let has_condition = state
        .instance
        .status
        .as_ref()
        .and_then(|s| s.condition(CONDITION_TYPE_INSTALLED))
        .is_some();
    if !has_condition {
        state.instance.update_state_processing(
            CONDITION_TYPE_INSTALLED,
            REASON_INITIALIZED,
            "initialized",
        );
    }

    StageResult::next(Stage::Render)
}

/// Render the manifest bundle into the working set.
pub(super) fn sfn_render(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    let next = if state.deleting() {
        Stage::Delete
    } else {
        Stage::ApplyManifest
    };

    if !state.objects.is_empty() {
        debug!(objects = state.objects.len(), "Working set already rendered");
        return StageResult::next(next);
    }

    let rendered =
        RenderContext::from_keda(&state.instance).and_then(|ctx| render(&fsm.template, &ctx));
    match rendered {
        Ok(objects) => {
            debug!(objects = objects.len(), "Rendered manifest");
            state.objects = objects;
            StageResult::next(next)
        }
        Err(e) => {
            let (type_, reason) = if state.deleting() {
                (CONDITION_TYPE_DELETED, REASON_DELETION_ERR)
            } else {
                (CONDITION_TYPE_INSTALLED, REASON_RENDER_ERR)
            };
            state.instance.update_state_from_err(type_, reason, &e);
            fail(Error::Render(e))
        }
    }
}
