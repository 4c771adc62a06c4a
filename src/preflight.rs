//! Refuses to start on a cluster that already runs a Keda installation
//! keda-manager does not own.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::{LABEL_MANAGED_BY, MANAGER_NAME};

/// Label every Keda operator deployment carries, whoever installed it.
pub const KEDA_APP_SELECTOR: &str = "app=keda-operator";

/// Names of the deployments in `deployments` that keda-manager did not install.
pub fn foreign_installations(deployments: &[Deployment]) -> Vec<String> {
    deployments
        .iter()
        .filter(|d| d.labels().get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGER_NAME))
        .map(|d| format!("{}/{}", d.namespace().unwrap_or_default(), d.name()))
        .collect()
}

/// Fail with [`Error::PreflightConflict`] if a competing installation exists.
pub async fn is_installed(client: Client) -> Result<()> {
    let api: Api<Deployment> = Api::all(client);
    let deployments = api.list(&ListParams::default().labels(KEDA_APP_SELECTOR)).await?;
    debug!(found = deployments.items.len(), "Listed keda operator deployments");

    let foreign = foreign_installations(&deployments.items);
    if !foreign.is_empty() {
        return Err(Error::PreflightConflict(foreign.join(", ")));
    }
    info!("No conflicting keda installation found");
    Ok(())
}
