//! Error types of the operator.

use thiserror::Error;

/// The manifest bundle could not be turned into cluster objects.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The template has no objects.
    #[error("manifest bundle contains no objects")]
    Empty,
    /// An object lacks `apiVersion`, `kind` or a name.
    #[error("manifest object #{index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },
    /// The resource lacks metadata an owner reference needs.
    #[error("keda resource is missing {0}, cannot own rendered objects")]
    MissingOwner(&'static str),
}

/// A target workload could not be patched.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The named deployment was not rendered.
    #[error("deployment {0} is not part of the rendered manifest")]
    TargetMissing(String),
    /// A path of the deployment is absent or not of the expected type.
    #[error("field {0} is missing or has the wrong type")]
    MissingField(&'static str),
    /// The pod template does not hold exactly one container.
    #[error("expected exactly one container, found {0}")]
    ContainerCount(usize),
    /// A container field did not deserialize.
    #[error("container field {field} cannot be read: {source}")]
    Decode {
        /// Path of the field.
        field: &'static str,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// A value did not serialize into a container field.
    #[error("container field {field} cannot be written: {source}")]
    Encode {
        /// Path of the field.
        field: &'static str,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// The manifest file could not be read.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file could not be read.
    #[error("unable to read manifest {path}: {source}")]
    Io {
        /// Path of the manifest.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A document is not valid YAML.
    #[error("unable to parse manifest document #{index}: {source}")]
    Yaml {
        /// Position of the document in the file.
        index: usize,
        /// The underlying error.
        #[source]
        source: serde_yaml::Error,
    },
    /// A document has no `apiVersion`, `kind` and `metadata`.
    #[error("manifest document #{index} is not a kubernetes object: {source}")]
    Object {
        /// Position of the document in the file.
        index: usize,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by a reconciliation pass.
#[derive(Debug, Error)]
pub enum Error {
    /// Rendering the template failed.
    #[error(transparent)]
    Render(#[from] RenderError),
    /// Patching a target deployment failed.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// Server-side apply of an object failed.
    #[error("unable to apply {kind} {name}: {source}")]
    Apply {
        /// Kind of the object.
        kind: String,
        /// Name of the object.
        name: String,
        /// The underlying error.
        #[source]
        source: kube::Error,
    },
    /// Deleting an object failed.
    #[error("unable to delete {kind} {name}: {source}")]
    Delete {
        /// Kind of the object.
        kind: String,
        /// Name of the object.
        name: String,
        /// The underlying error.
        #[source]
        source: kube::Error,
    },
    /// Reading a target deployment for readiness failed.
    #[error("unable to read deployment {name}: {source}")]
    Verify {
        /// Name of the object.
        name: String,
        /// The underlying error.
        #[source]
        source: kube::Error,
    },
    /// Any other API call failed.
    #[error("unable to update keda resource: {0}")]
    Kube(#[from] kube::Error),
    /// A shutdown signal cancelled the pass before the named stage finished.
    #[error("reconciliation interrupted by shutdown at stage {0}")]
    Interrupted(String),
    /// A stage asked for an edge the stage table does not allow.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
    /// The pass ran more stages than allowed.
    #[error("reconciliation did not finish within {0} stages")]
    Exhausted(usize),
    /// Leadership over the named lease was lost.
    #[error("leadership lease {0} was lost")]
    LeaseLost(String),
    /// Keda was installed by something other than keda-manager.
    #[error(
        "keda-manager can't be installed on a cluster with an existing Keda installation ({0})"
    )]
    PreflightConflict(String),
}

impl Error {
    /// Whether the scheduler should retry the object with backoff.
    pub fn requeue(&self) -> bool {
        !matches!(
            self,
            Error::Render(_) | Error::IllegalTransition { .. } | Error::PreflightConflict(_)
        )
    }

    /// Whether the error is a write that lost a race with another writer.
    pub fn is_conflict(&self) -> bool {
        let source = match self {
            Error::Apply { source, .. }
            | Error::Delete { source, .. }
            | Error::Verify { source, .. }
            | Error::Kube(source) => source,
            _ => return false,
        };
        matches!(source, kube::Error::Api(response) if response.code == 409)
    }
}

/// Convenience alias for results in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}
