//! The reconciliation state machine for `Keda` resources.
//!
//! A pass starts at [`Stage::Initialize`] with a fresh [`SystemState`] and
//! walks the edges of [`stage::TRANSITIONS`]:
//!
//! ```text
//! Initialize -> Render -> ApplyManifest -> OperatorLogging -> OperatorResources
//!   -> OperatorEnv -> MetricsServerLogging -> MetricsServerResources
//!   -> MetricsServerEnv -> ApplyPatched -> Verify -> UpdateStatus
//!
//! Render -> Delete -> VerifyDeletion -> RemoveFinalizer
//!                                  \-> UpdateStatus
//! ```
//!
//! Stages never call each other. Each one returns the next stage and the
//! engine from the `statefn` crate drives the walk.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::Resource;
use statefn::{run_to_completion, Directive, StateMachine, Stopped, Transition};
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::crd::Keda;
use crate::error::{Error, Result};
use crate::events::{self, EventPublisher, NoopEventPublisher};
use crate::manifest::{kind_of, name_of};

mod apply;
mod delete;
mod initialize;
pub mod stage;
mod state;
mod update_objects;
mod verify;

pub use delete::deletion_order;
pub use stage::Stage;
pub use state::{Field, SystemState, Target};
pub use update_objects::{
    METRICS_SERVER_VERBOSITY_FLAG, OPERATOR_LOG_FORMAT_FLAG, OPERATOR_LOG_LEVEL_FLAG,
    OPERATOR_TIME_ENCODING_FLAG,
};
pub use verify::{deployment_readiness, Readiness};

/// Finalizer that keeps a `Keda` resource around until its objects are gone.
pub const FINALIZER: &str = "operator.kyma-project.io/keda-manager";

/// Name of the operator deployment in the stock bundle.
pub const DEFAULT_OPERATOR_DEPLOYMENT: &str = "keda-operator";
/// Name of the metrics server deployment in the stock bundle.
pub const DEFAULT_METRICS_SERVER_DEPLOYMENT: &str = "keda-operator-metrics-apiserver";

const DEPLOYMENT_KIND: &str = "Deployment";

type StageResult = Transition<Stage, Error>;

/// Turns an error into a failed transition, retrying when the error allows it.
fn fail(error: Error) -> StageResult {
    if error.requeue() {
        Transition::fail_and_requeue(error)
    } else {
        Transition::fail_no_requeue(error)
    }
}

fn is_deployment(object: &DynamicObject, name: &str) -> bool {
    kind_of(object) == DEPLOYMENT_KIND && name_of(object) == name
}

/// Settings shared by every pass.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Name of the operator deployment in the template.
    pub operator_deployment: String,
    /// Name of the metrics server deployment in the template.
    pub metrics_server_deployment: String,
    /// How long to wait before re-checking readiness or removal.
    pub ready_poll_interval: Duration,
    /// Upper bound on the stages one pass may run.
    pub max_steps: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            operator_deployment: DEFAULT_OPERATOR_DEPLOYMENT.to_string(),
            metrics_server_deployment: DEFAULT_METRICS_SERVER_DEPLOYMENT.to_string(),
            ready_poll_interval: Duration::from_secs(5),
            max_steps: 64,
        }
    }
}

impl ReconcilerConfig {
    /// Name of the deployment `target` refers to.
    pub fn deployment_name(&self, target: Target) -> &str {
        match target {
            Target::Operator => &self.operator_deployment,
            Target::MetricsServer => &self.metrics_server_deployment,
        }
    }
}

/// The long-lived reconciler handle.
///
/// Holds the cluster client, the parsed manifest and the configuration.
/// Nothing about an individual pass is stored here, so one `Fsm` serves
/// every `Keda` resource concurrently.
pub struct Fsm {
    cluster: Arc<dyn Cluster>,
    template: Arc<Vec<DynamicObject>>,
    config: ReconcilerConfig,
    signal: Option<Arc<AtomicBool>>,
    events: Arc<dyn EventPublisher>,
}

impl Fsm {
    /// A reconciler that renders `template` and publishes no events.
    pub fn new(
        cluster: Arc<dyn Cluster>,
        template: Arc<Vec<DynamicObject>>,
        config: ReconcilerConfig,
    ) -> Self {
        Fsm {
            cluster,
            template,
            config,
            signal: None,
            events: Arc::new(NoopEventPublisher),
        }
    }

    /// Publish an event through `events` whenever a status write changes state.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Abandon passes once `signal` is raised, cancelling a running stage.
    pub fn with_signal(mut self, signal: Arc<AtomicBool>) -> Self {
        self.signal = Some(signal);
        self
    }

    fn is_target(&self, object: &DynamicObject) -> bool {
        is_deployment(object, &self.config.operator_deployment)
            || is_deployment(object, &self.config.metrics_server_deployment)
    }

    /// Run one pass for `keda`.
    ///
    /// A failed stage still gets its condition written before the error is
    /// returned. An interrupted pass writes nothing.
    pub async fn reconcile(&self, keda: Keda) -> Result<Directive> {
        self.run(SystemState::new(keda))
            .await
            .map(|(directive, _)| directive)
    }

    /// Run one pass and hand back the final state along with the directive.
    pub async fn run(&self, mut state: SystemState) -> Result<(Directive, SystemState)> {
        let outcome = run_to_completion(
            self,
            Stage::Initialize,
            &mut state,
            self.config.max_steps,
            self.signal.as_ref(),
        )
        .await;

        match outcome {
            Ok(directive) => Ok((directive, state)),
            Err(Stopped::Failed { error, .. }) => {
                if let Err(e) = self.persist_status(&mut state).await {
                    warn!(error = %e, "Unable to record failure in keda status");
                }
                Err(error)
            }
            Err(Stopped::Interrupted { pending }) => Err(Error::Interrupted(pending.to_string())),
            Err(Stopped::IllegalTransition { from, to }) => Err(Error::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
            Err(Stopped::Exhausted { .. }) => Err(Error::Exhausted(self.config.max_steps)),
        }
    }

    /// Write the status if it differs from what was last written.
    async fn persist_status(&self, state: &mut SystemState) -> Result<()> {
        if !state.status_dirty() {
            return Ok(());
        }
        let previous = state.persisted().cloned();
        if let Some(status) = state.instance.status.as_ref() {
            debug!(state = ?status.state, "Persisting keda status");
            self.cluster.patch_status(&state.instance, status).await?;
        }
        state.mark_persisted();
        if let Some(event) = events::state_change(previous.as_ref(), &state.instance) {
            let regarding = state.instance.object_ref(&());
            self.events.publish(&regarding, event).await;
        }
        Ok(())
    }
}

async fn sfn_update_status(fsm: &Fsm, state: &mut SystemState) -> StageResult {
    match fsm.persist_status(state).await {
        Ok(()) => Transition::Stop(state.directive),
        Err(e) => fail(e),
    }
}

#[async_trait::async_trait]
impl StateMachine for Fsm {
    type Stage = Stage;
    type State = SystemState;
    type Error = Error;

    async fn step(&self, stage: Stage, state: &mut SystemState) -> StageResult {
        match stage {
            Stage::Initialize => initialize::sfn_initialize(self, state).await,
            Stage::Render => initialize::sfn_render(self, state),
            Stage::ApplyManifest => apply::sfn_apply_manifest(self, state).await,
            Stage::OperatorLogging => update_objects::OPERATOR_LOGGING.run(self, state),
            Stage::OperatorResources => update_objects::OPERATOR_RESOURCES.run(self, state),
            Stage::OperatorEnv => update_objects::OPERATOR_ENV.run(self, state),
            Stage::MetricsServerLogging => update_objects::METRICS_SERVER_LOGGING.run(self, state),
            Stage::MetricsServerResources => {
                update_objects::METRICS_SERVER_RESOURCES.run(self, state)
            }
            Stage::MetricsServerEnv => update_objects::METRICS_SERVER_ENV.run(self, state),
            Stage::ApplyPatched => apply::sfn_apply_patched(self, state).await,
            Stage::Verify => verify::sfn_verify(self, state).await,
            Stage::UpdateStatus => sfn_update_status(self, state).await,
            Stage::Delete => delete::sfn_delete(self, state).await,
            Stage::VerifyDeletion => delete::sfn_verify_deletion(self, state).await,
            Stage::RemoveFinalizer => delete::sfn_remove_finalizer(self, state).await,
        }
    }

    fn permits(&self, from: Stage, to: Stage) -> bool {
        from.permits(to)
    }
}
