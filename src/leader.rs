//! Lease based leader election.
//!
//! Replicas compete for one `coordination.k8s.io/v1` Lease and only the
//! holder runs the controller. The holder renews the lease every
//! [`RENEW_INTERVAL`]. A lease left unrenewed for its duration may be taken
//! over by another replica.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, error, info, warn};

use crate::error::{is_not_found, Error, Result};

/// Name of the Lease all replicas compete for.
pub const LEASE_NAME: &str = "4123c01c.operator.kyma-project.io";
/// How long a lease stays valid without renewal.
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
/// Time between two renewals, and between two acquisition attempts.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Which lease is taken, by whom, and for how long.
#[derive(Clone, Debug)]
pub struct LeaseLockParams {
    /// Identity written into the lease, unique per replica.
    pub holder_id: String,
    /// Name of the Lease object.
    pub lease_name: String,
    /// Duration written into the lease.
    pub lease_ttl: Duration,
}

fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let last = match spec.renew_time.as_ref().or_else(|| spec.acquire_time.as_ref()) {
        Some(time) => time.0,
        None => return true,
    };
    let ttl = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    last + ttl < now
}

/// The spec `params.holder_id` writes to hold the lease at `now`.
///
/// `None` while another replica holds a live lease.
pub fn claim(
    current: &LeaseSpec,
    params: &LeaseLockParams,
    now: DateTime<Utc>,
) -> Option<LeaseSpec> {
    let ttl = i32::try_from(params.lease_ttl.as_secs()).unwrap_or(i32::MAX);
    let holder = current
        .holder_identity
        .as_deref()
        .filter(|holder| !holder.is_empty());
    match holder {
        Some(holder) if holder == params.holder_id => Some(LeaseSpec {
            lease_duration_seconds: Some(ttl),
            renew_time: Some(MicroTime(now)),
            ..current.clone()
        }),
        Some(_) if !is_expired(current, now) => None,
        previous => Some(LeaseSpec {
            holder_identity: Some(params.holder_id.clone()),
            lease_duration_seconds: Some(ttl),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(
                current.lease_transitions.unwrap_or(0) + i32::from(previous.is_some()),
            ),
        }),
    }
}

/// A Lease held on behalf of this process.
pub struct LeaseLock {
    leases: Api<Lease>,
    params: LeaseLockParams,
}

impl LeaseLock {
    /// A lock on the lease named in `params` inside `namespace`.
    pub fn new(client: Client, namespace: &str, params: LeaseLockParams) -> Self {
        LeaseLock {
            leases: Api::namespaced(client, namespace),
            params,
        }
    }

    /// Take or renew the lease. `Ok(false)` means another replica holds it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let mut lease = match self.leases.get(&self.params.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_not_found(&e) => return self.create(now).await,
            Err(e) => return Err(e.into()),
        };
        let spec = match claim(&lease.spec.clone().unwrap_or_default(), &self.params, now) {
            Some(spec) => spec,
            None => {
                let holder = lease.spec.and_then(|s| s.holder_identity);
                debug!(?holder, "Lease is held elsewhere");
                return Ok(false);
            }
        };
        lease.spec = Some(spec);
        // The read resourceVersion is kept, a concurrent writer makes this fail.
        match self
            .leases
            .replace(&self.params.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.params.lease_name.clone()),
                ..Default::default()
            },
            spec: claim(&LeaseSpec::default(), &self.params, now),
        };
        match self.leases.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the lease is ours or `signal` is raised.
    ///
    /// Returns whether the lease was acquired.
    pub async fn acquire(&self, signal: &AtomicBool) -> bool {
        info!(
            lease = %self.params.lease_name,
            holder = %self.params.holder_id,
            "Waiting to acquire leadership"
        );
        while !signal.load(Ordering::Relaxed) {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired leadership");
                    return true;
                }
                Ok(false) => debug!("Another replica is leader, waiting"),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
        false
    }

    /// Renew the lease until `signal` is raised.
    ///
    /// Fails once the lease is lost, or when no renewal succeeded for a
    /// whole lease duration.
    pub async fn hold(&self, signal: Arc<AtomicBool>) -> Result<()> {
        let mut renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            if signal.load(Ordering::Relaxed) {
                return Ok(());
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    error!("Lost leadership");
                    return Err(Error::LeaseLost(self.params.lease_name.clone()));
                }
                Err(e) if renewed.elapsed() < self.params.lease_ttl => {
                    warn!(error = %e, "Failed to renew lease, retrying");
                }
                Err(e) => {
                    error!(error = %e, "Lease expired without renewal");
                    return Err(Error::LeaseLost(self.params.lease_name.clone()));
                }
            }
        }
    }

    /// Give the lease up so another replica does not wait for it to expire.
    pub async fn step_down(&self) -> Result<()> {
        let mut lease = match self.leases.get(&self.params.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if spec.holder_identity.as_deref() != Some(self.params.holder_id.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        spec.acquire_time = None;
        self.leases
            .replace(&self.params.lease_name, &PostParams::default(), &lease)
            .await?;
        info!("Released leadership");
        Ok(())
    }
}
