use k8s_openapi::api::apps::v1::Deployment;
use statefn::Directive;
use tracing::{debug, info};

use super::stage::Stage;
use super::state::{SystemState, Target};
use super::{fail, Fsm, StageResult};
use crate::crd::State;
use crate::error::Error;
use crate::status::{
    CONDITION_TYPE_INSTALLED, REASON_VERIFICATION, REASON_VERIFICATION_ERR, REASON_VERIFIED,
};

/// Observed readiness of one deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Available with every desired replica ready.
    Ready,
    /// Anything else, with what is missing.
    NotReady(String),
}

/// A deployment is ready when its `Available` condition is `True` and every
/// desired replica is ready. `spec.replicas` defaults to 1.
pub fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = match deployment.status.as_ref() {
        Some(status) => status,
        None => return Readiness::NotReady("no status reported yet".to_string()),
    };

    let available = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Available" && c.status == "True");
    if !available {
        return Readiness::NotReady("deployment is not available".to_string());
    }

    let ready = status.ready_replicas.unwrap_or(0);
    if ready != desired {
        return Readiness::NotReady(format!("{}/{} replicas ready", ready, desired));
    }
    Readiness::Ready
}

pub(super) async fn sfn_verify(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    let namespace = state
        .instance
        .metadata
        .namespace
        .clone()
        .unwrap_or_default();

    let mut waiting = Vec::new();
    for target in [Target::Operator, Target::MetricsServer] {
        let name = fsm.config.deployment_name(target);
        let readiness = match fsm.cluster.deployment(&namespace, name).await {
            Ok(Some(deployment)) => deployment_readiness(&deployment),
            Ok(None) => Readiness::NotReady("not found".to_string()),
            Err(source) => {
                let error = Error::Verify {
                    name: name.to_string(),
                    source,
                };
                state.instance.update_state_from_err(
                    CONDITION_TYPE_INSTALLED,
                    REASON_VERIFICATION_ERR,
                    &error,
                );
                return fail(error);
            }
        };
        if let Readiness::NotReady(why) = readiness {
            debug!(deployment = name, %why, "Deployment not ready");
            waiting.push(format!("{}: {}", name, why));
        }
    }

    if waiting.is_empty() {
        if state.instance.state() != Some(State::Ready) {
            info!("Keda is ready");
        }
        state.instance.update_state_ready(
            CONDITION_TYPE_INSTALLED,
            REASON_VERIFIED,
            "keda-manager verified",
        );
        state.directive = Directive::Done;
    } else {
        state.instance.update_state_processing(
            CONDITION_TYPE_INSTALLED,
            REASON_VERIFICATION,
            format!("waiting for deployments: {}", waiting.join(", ")),
        );
        state.directive = Directive::RequeueAfter(fsm.config.ready_poll_interval);
    }
    StageResult::next(Stage::UpdateStatus)
}
