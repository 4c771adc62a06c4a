//! Condition model of the `Keda` status.
//!
//! `status.state` is a projection of the condition set. Nothing writes it
//! directly; every helper here writes a condition and then re-projects.

use std::fmt::Display;

use crate::crd::{Condition, ConditionStatus, Keda, KedaStatus, State};

/// Tracks the installation of Keda.
pub const CONDITION_TYPE_INSTALLED: &str = "Installed";
/// Tracks the removal of Keda, present once deletion started.
pub const CONDITION_TYPE_DELETED: &str = "Deleted";

/// The resource was seen for the first time.
pub const REASON_INITIALIZED: &str = "Initialized";
/// The manifest could not be rendered.
pub const REASON_RENDER_ERR: &str = "RenderErr";
/// An object could not be applied.
pub const REASON_APPLY_OBJ_ERROR: &str = "ApplyObjError";
/// A target deployment could not be patched.
pub const REASON_DEPLOYMENT_UPDATE_ERR: &str = "DeploymentUpdateErr";
/// Waiting for the workloads to become ready.
pub const REASON_VERIFICATION: &str = "Verification";
/// Readiness could not be read.
pub const REASON_VERIFICATION_ERR: &str = "VerificationErr";
/// Both workloads are ready.
pub const REASON_VERIFIED: &str = "Verified";
/// Waiting for the objects to disappear.
pub const REASON_DELETION: &str = "Deletion";
/// An object could not be deleted.
pub const REASON_DELETION_ERR: &str = "DeletionErr";
/// Every object is gone.
pub const REASON_DELETED: &str = "Deleted";

impl KedaStatus {
    /// The condition of type `type_`, if any.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace the condition of the same type.
    ///
    /// The transition time is carried over when the status value is
    /// unchanged, so re-recording the same condition is a no-op.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
        self.project();
    }

    /// Recompute `state` from the conditions.
    pub fn project(&mut self) {
        let deleted = self.condition(CONDITION_TYPE_DELETED).map(|c| c.status);
        let installed = self.condition(CONDITION_TYPE_INSTALLED).map(|c| c.status);
        self.state = Some(match (deleted, installed) {
            (Some(ConditionStatus::False), _) => State::Error,
            (Some(_), _) => State::Deleting,
            (None, Some(ConditionStatus::True)) => State::Ready,
            (None, Some(ConditionStatus::False)) => State::Error,
            (None, _) => State::Processing,
        });
    }
}

impl Keda {
    /// The projected state, `None` before the first status write.
    pub fn state(&self) -> Option<State> {
        self.status.as_ref().and_then(|s| s.state)
    }

    fn record(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: String) {
        let condition = Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message,
            observed_generation: self.metadata.generation,
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.status
            .get_or_insert_with(KedaStatus::default)
            .set_condition(condition);
    }

    /// Records a `False` condition carrying `err` as message.
    pub fn update_state_from_err(&mut self, type_: &str, reason: &str, err: &dyn Display) {
        self.record(type_, ConditionStatus::False, reason, err.to_string());
    }

    /// Records an `Unknown` condition.
    pub fn update_state_processing(
        &mut self,
        type_: &str,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.record(type_, ConditionStatus::Unknown, reason, message.into());
    }

    /// Records a `True` condition.
    pub fn update_state_ready(
        &mut self,
        type_: &str,
        reason: &str,
        message: impl Into<String>,
    ) {
        self.record(type_, ConditionStatus::True, reason, message.into());
    }

    /// Marks the installation as being torn down.
    pub fn update_state_deletion(&mut self, reason: &str, message: impl Into<String>) {
        self.record(
            CONDITION_TYPE_DELETED,
            ConditionStatus::Unknown,
            reason,
            message.into(),
        );
    }
}
