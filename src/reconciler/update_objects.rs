//! Patch stages for the two target deployments.
//!
//! All six stages share one shape: select a piece of the declared
//! configuration, find the target in the working set, rewrite one container
//! field and move on. [`UpdateObject`] is that shape; the constants below are
//! its instances.

use k8s_openapi::api::core::v1::ResourceRequirements;
use tracing::{debug, trace};

use super::stage::Stage;
use super::state::{Field, SystemState, Target};
use super::{fail, Fsm, StageResult, DEPLOYMENT_KIND};
use crate::crd::{Keda, LoggingMetricsSrvCfg, LoggingOperatorCfg, NameValue};
use crate::error::{Error, PatchError};
use crate::status::{CONDITION_TYPE_INSTALLED, REASON_DEPLOYMENT_UPDATE_ERR};
use crate::workload::ContainerView;

/// Operator flag carrying `logging.operator.level`.
pub const OPERATOR_LOG_LEVEL_FLAG: &str = "zap-log-level";
/// Operator flag carrying `logging.operator.format`.
pub const OPERATOR_LOG_FORMAT_FLAG: &str = "zap-encoder";
/// Operator flag carrying `logging.operator.timeEncoding`.
pub const OPERATOR_TIME_ENCODING_FLAG: &str = "zap-time-encoding";
/// Metrics server flag carrying the klog verbosity.
pub const METRICS_SERVER_VERBOSITY_FLAG: &str = "v";

/// Select the input of a patch from the declared configuration.
/// `None` means nothing is declared and the stage passes through.
pub type Select<T> = for<'a> fn(&'a Keda) -> Option<&'a T>;

/// Apply the input to a container, returning whether anything changed.
pub type Update<T> = fn(&mut ContainerView<'_>, &T) -> Result<bool, PatchError>;

/// A patch stage.
pub struct UpdateObject<T: 'static> {
    pub target: Target,
    pub field: Field,
    pub select: Select<T>,
    pub update: Update<T>,
    pub next: Stage,
}

impl<T: 'static> UpdateObject<T> {
    pub(super) fn run(&self, fsm: &Fsm, state: &mut SystemState) -> StageResult {
        let data = match (self.select)(&state.instance) {
            Some(data) => data,
            None => {
                trace!(
                    target = ?self.target,
                    field = ?self.field,
                    "Nothing declared, keeping rendered defaults"
                );
                return StageResult::next(self.next);
            }
        };

        let name = fsm.config.deployment_name(self.target);
        let result = match state
            .objects
            .iter_mut()
            .find(|o| super::is_deployment(o, name))
        {
            Some(object) => {
                ContainerView::of(object).and_then(|mut view| (self.update)(&mut view, data))
            }
            None => Err(PatchError::TargetMissing(name.to_string())),
        };

        match result {
            Ok(changed) => {
                if changed {
                    debug!(deployment = name, field = ?self.field, "Patched deployment");
                    state.changed.insert((self.target, self.field));
                }
                StageResult::next(self.next)
            }
            Err(e) => {
                let error = Error::Patch(e);
                state.instance.update_state_from_err(
                    CONDITION_TYPE_INSTALLED,
                    REASON_DEPLOYMENT_UPDATE_ERR,
                    &format!("{} {}: {}", DEPLOYMENT_KIND, name, error),
                );
                fail(error)
            }
        }
    }
}

pub const OPERATOR_LOGGING: UpdateObject<LoggingOperatorCfg> = UpdateObject {
    target: Target::Operator,
    field: Field::Logging,
    select: operator_logging,
    update: update_operator_logging,
    next: Stage::OperatorResources,
};

pub const OPERATOR_RESOURCES: UpdateObject<ResourceRequirements> = UpdateObject {
    target: Target::Operator,
    field: Field::Resources,
    select: operator_resources,
    update: update_resources,
    next: Stage::OperatorEnv,
};

pub const OPERATOR_ENV: UpdateObject<Vec<NameValue>> = UpdateObject {
    target: Target::Operator,
    field: Field::Env,
    select: env_vars,
    update: update_env,
    next: Stage::MetricsServerLogging,
};

pub const METRICS_SERVER_LOGGING: UpdateObject<LoggingMetricsSrvCfg> = UpdateObject {
    target: Target::MetricsServer,
    field: Field::Logging,
    select: metrics_server_logging,
    update: update_metrics_server_logging,
    next: Stage::MetricsServerResources,
};

pub const METRICS_SERVER_RESOURCES: UpdateObject<ResourceRequirements> = UpdateObject {
    target: Target::MetricsServer,
    field: Field::Resources,
    select: metrics_server_resources,
    update: update_resources,
    next: Stage::MetricsServerEnv,
};

pub const METRICS_SERVER_ENV: UpdateObject<Vec<NameValue>> = UpdateObject {
    target: Target::MetricsServer,
    field: Field::Env,
    select: env_vars,
    update: update_env,
    next: Stage::ApplyPatched,
};

fn operator_logging(keda: &Keda) -> Option<&LoggingOperatorCfg> {
    keda.spec.logging.as_ref()?.operator.as_ref()
}

fn metrics_server_logging(keda: &Keda) -> Option<&LoggingMetricsSrvCfg> {
    keda.spec.logging.as_ref()?.metrics_server.as_ref()
}

fn operator_resources(keda: &Keda) -> Option<&ResourceRequirements> {
    keda.spec.resources.as_ref()?.operator.as_ref()
}

fn metrics_server_resources(keda: &Keda) -> Option<&ResourceRequirements> {
    keda.spec.resources.as_ref()?.metrics_server.as_ref()
}

// An empty list would still write `env: []` over a rendered container
// without env, so it counts as nothing declared.
fn env_vars(keda: &Keda) -> Option<&Vec<NameValue>> {
    Some(&keda.spec.env).filter(|env| !env.is_empty())
}

fn update_operator_logging(
    view: &mut ContainerView<'_>,
    cfg: &LoggingOperatorCfg,
) -> Result<bool, PatchError> {
    let mut changed = false;
    if let Some(level) = cfg.level {
        changed |= view.set_flag(OPERATOR_LOG_LEVEL_FLAG, &level.to_string())?;
    }
    if let Some(format) = cfg.format {
        changed |= view.set_flag(OPERATOR_LOG_FORMAT_FLAG, &format.to_string())?;
    }
    if let Some(encoding) = cfg.time_encoding {
        changed |= view.set_flag(OPERATOR_TIME_ENCODING_FLAG, &encoding.to_string())?;
    }
    Ok(changed)
}

fn update_metrics_server_logging(
    view: &mut ContainerView<'_>,
    cfg: &LoggingMetricsSrvCfg,
) -> Result<bool, PatchError> {
    match cfg.level {
        Some(level) => view.set_flag(METRICS_SERVER_VERBOSITY_FLAG, &level.verbosity().to_string()),
        None => Ok(false),
    }
}

fn update_resources(
    view: &mut ContainerView<'_>,
    resources: &ResourceRequirements,
) -> Result<bool, PatchError> {
    view.set_resources(resources)
}

fn update_env(view: &mut ContainerView<'_>, env: &Vec<NameValue>) -> Result<bool, PatchError> {
    view.merge_env(env)
}
