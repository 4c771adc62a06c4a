//! keda-manager installs Keda into a cluster and keeps it configured as a
//! `Keda` custom resource declares.
//!
//! The [`reconciler`] renders the bundled manifest for a resource, patches
//! logging, resources and environment of the operator and metrics server
//! deployments, applies everything and waits for both workloads to become
//! ready. Deleting the resource removes the installation again.

#![warn(missing_docs)]

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod leader;
pub mod manifest;
pub mod metrics;
pub mod preflight;
pub mod reconciler;
pub mod server;
pub mod status;
pub mod workload;

pub use crate::error::{Error, Result};
#[doc(inline)]
pub use crate::reconciler::Fsm;
