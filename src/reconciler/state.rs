use std::collections::BTreeSet;

use kube::api::DynamicObject;
use statefn::Directive;

use crate::crd::{Keda, KedaStatus};
use crate::manifest::{kind_of, name_of};

/// A deployment the reconciler patches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// The keda operator deployment.
    Operator,
    /// The keda metrics API server deployment.
    MetricsServer,
}

/// A container field a patch stage owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// Logging flags in the container args.
    Logging,
    /// Container resource requirements.
    Resources,
    /// Container environment.
    Env,
}

/// Everything one pass learns about a `Keda` resource.
///
/// Created fresh for every pass and dropped when it ends. Stages only ever
/// see it through `&mut`, one at a time.
#[derive(Debug)]
pub struct SystemState {
    /// The resource as observed at the start of the pass, plus the
    /// conditions recorded so far.
    pub instance: Keda,
    /// The rendered working set. Patch stages edit it in place.
    pub objects: Vec<DynamicObject>,
    /// Fields the patch stages actually changed.
    pub changed: BTreeSet<(Target, Field)>,
    /// What the scheduler should do once the pass reaches `UpdateStatus`.
    pub directive: Directive,
    persisted: Option<KedaStatus>,
}

impl SystemState {
    /// A fresh state for one pass over `instance`.
    pub fn new(instance: Keda) -> Self {
        let persisted = instance.status.clone();
        SystemState {
            instance,
            objects: Vec::new(),
            changed: BTreeSet::new(),
            directive: Directive::Done,
            persisted,
        }
    }

    /// Whether the resource carries a deletion timestamp.
    pub fn deleting(&self) -> bool {
        self.instance.metadata.deletion_timestamp.is_some()
    }

    /// The rendered object of `kind` named `name`.
    pub fn object(&self, kind: &str, name: &str) -> Option<&DynamicObject> {
        self.objects
            .iter()
            .find(|o| kind_of(o) == kind && name_of(o) == name)
    }

    /// Whether the status differs from what was last written.
    pub fn status_dirty(&self) -> bool {
        self.instance.status != self.persisted
    }

    /// The status as last written, or as read at the start of the pass.
    pub fn persisted(&self) -> Option<&KedaStatus> {
        self.persisted.as_ref()
    }

    pub(super) fn mark_persisted(&mut self) {
        self.persisted = self.instance.status.clone();
    }
}
