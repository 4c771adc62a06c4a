//! Stages of a pass and the edges between them.

use std::fmt;

/// One step of a reconciliation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Adds the finalizer, or routes a deleted resource to `Render`.
    Initialize,
    /// Renders the template for the resource.
    Render,
    /// Applies everything except the target deployments.
    ApplyManifest,
    /// Sets the operator logging flags.
    OperatorLogging,
    /// Sets the operator resource requirements.
    OperatorResources,
    /// Merges the environment into the operator container.
    OperatorEnv,
    /// Sets the metrics server verbosity.
    MetricsServerLogging,
    /// Sets the metrics server resource requirements.
    MetricsServerResources,
    /// Merges the environment into the metrics server container.
    MetricsServerEnv,
    /// Applies the patched target deployments.
    ApplyPatched,
    /// Checks both workloads for readiness.
    Verify,
    /// Persists the status and ends the pass.
    UpdateStatus,
    /// Deletes the rendered objects.
    Delete,
    /// Checks every object is gone.
    VerifyDeletion,
    /// Releases the resource.
    RemoveFinalizer,
}

use Stage::*;

/// Every edge of the state graph. A stage without successors ends the pass.
pub const TRANSITIONS: &[(Stage, &[Stage])] = &[
    (Initialize, &[Render]),
    (Render, &[ApplyManifest, Delete]),
    (ApplyManifest, &[OperatorLogging]),
    (OperatorLogging, &[OperatorResources]),
    (OperatorResources, &[OperatorEnv]),
    (OperatorEnv, &[MetricsServerLogging]),
    (MetricsServerLogging, &[MetricsServerResources]),
    (MetricsServerResources, &[MetricsServerEnv]),
    (MetricsServerEnv, &[ApplyPatched]),
    (ApplyPatched, &[Verify]),
    (Verify, &[UpdateStatus]),
    (UpdateStatus, &[]),
    (Delete, &[VerifyDeletion]),
    (VerifyDeletion, &[RemoveFinalizer, UpdateStatus]),
    (RemoveFinalizer, &[]),
];

impl Stage {
    /// Stages this one may hand over to.
    pub fn successors(self) -> &'static [Stage] {
        TRANSITIONS
            .iter()
            .find(|(stage, _)| *stage == self)
            .map(|(_, next)| *next)
            .unwrap_or(&[])
    }

    /// Whether `self -> to` is an edge.
    pub fn permits(self, to: Stage) -> bool {
        self.successors().contains(&to)
    }

    /// The patch stages, in the order they run.
    pub const PATCHES: [Stage; 6] = [
        OperatorLogging,
        OperatorResources,
        OperatorEnv,
        MetricsServerLogging,
        MetricsServerResources,
        MetricsServerEnv,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
