//! Kubernetes Events for `Keda` resources.
//!
//! An event is published whenever a status write moves the resource to a new
//! state or changes the condition that drives it. Publishing is
//! fire-and-forget: a failed event is logged and never fails the pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use crate::crd::{Condition, ConditionStatus, Keda, KedaStatus};
use crate::manifest::MANAGER_NAME;
use crate::status::{CONDITION_TYPE_DELETED, CONDITION_TYPE_INSTALLED};

/// Action of events about the installation.
pub const ACTION_INSTALL: &str = "Install";
/// Action of events about the removal.
pub const ACTION_DELETE: &str = "Delete";

/// What gets published about one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEvent {
    /// `Warning` for a failed condition, `Normal` otherwise.
    pub type_: EventType,
    /// Reason of the driving condition, e.g. `Verified`.
    pub reason: String,
    /// [`ACTION_INSTALL`] or [`ACTION_DELETE`].
    pub action: &'static str,
    /// The new state and condition message.
    pub note: Option<String>,
}

/// Where state change events go.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `event` on the object `regarding` points at.
    async fn publish(&self, regarding: &ObjectReference, event: StateEvent);
}

/// Publishes through `kube_runtime`'s [`Recorder`] as `keda-manager`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Publish through `client`.
    pub fn new(client: Client) -> Self {
        KubeEventPublisher {
            client,
            reporter: MANAGER_NAME.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: StateEvent) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            regarding.clone(),
        );
        let reason = event.reason.clone();
        let result = recorder
            .publish(Event {
                type_: event.type_,
                reason: event.reason,
                note: event.note,
                action: event.action.to_string(),
                secondary: None,
            })
            .await;
        if let Err(e) = result {
            warn!(%reason, error = %e, "Failed to publish keda event");
        }
    }
}

/// Drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, _event: StateEvent) {}
}

/// The condition `state` is projected from, with the action it describes.
fn driving_condition(status: &KedaStatus) -> Option<(&Condition, &'static str)> {
    match status.condition(CONDITION_TYPE_DELETED) {
        Some(deleted) => Some((deleted, ACTION_DELETE)),
        None => status
            .condition(CONDITION_TYPE_INSTALLED)
            .map(|installed| (installed, ACTION_INSTALL)),
    }
}

/// The event for going from the `previous` status to the status of `keda`.
///
/// `None` when neither the state nor the driving condition changed.
pub fn state_change(previous: Option<&KedaStatus>, keda: &Keda) -> Option<StateEvent> {
    let status = keda.status.as_ref()?;
    let state = status.state?;
    let (condition, action) = driving_condition(status)?;

    let before = previous.and_then(|p| p.condition(&condition.type_));
    let same_state = previous.and_then(|p| p.state) == Some(state);
    let same_condition = before.map(|c| (c.status, c.reason.as_str()))
        == Some((condition.status, condition.reason.as_str()));
    if same_state && same_condition {
        return None;
    }

    let type_ = match condition.status {
        ConditionStatus::False => EventType::Warning,
        ConditionStatus::True | ConditionStatus::Unknown => EventType::Normal,
    };
    let note = if condition.message.is_empty() {
        state.to_string()
    } else {
        format!("{}: {}", state, condition.message)
    };
    Some(StateEvent {
        type_,
        reason: condition.reason.clone(),
        action,
        note: Some(note),
    })
}
