use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use keda_manager::cluster::KubeCluster;
use keda_manager::config::{Config, LogFormat};
use keda_manager::events::KubeEventPublisher;
use keda_manager::leader::LeaseLock;
use keda_manager::metrics::Metrics;
use keda_manager::server::{self, Health};
use keda_manager::{controller, manifest, preflight, Fsm};
use tokio::signal::ctrl_c;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight passes get to wind down after a signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));
    init_tracing(&config);

    // Tries a KubeConfig file first, then falls back on an in-cluster configuration.
    let client = kube::Client::try_default().await?;

    // A competing installation is fatal, the process must not start.
    preflight::is_installed(client.clone()).await?;

    let template = manifest::load_manifest(&config.manifest).await?;
    info!(path = ?config.manifest, objects = template.len(), "Loaded manifest");

    // Flag to indicate graceful shutdown has started.
    let signal = Arc::new(AtomicBool::new(false));
    let fsm = Fsm::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(template),
        config.reconciler.clone(),
    )
    .with_events(Arc::new(KubeEventPublisher::new(client.clone())))
    .with_signal(Arc::clone(&signal));

    let metrics = Arc::new(Metrics::new());
    let health = Arc::new(Health::default());

    let mut signal_task = start_signal_task(Arc::clone(&signal)).fuse().boxed();
    let mut probes = server::serve_probes(config.probe_addr, Arc::clone(&health))
        .fuse()
        .boxed();
    let mut metrics_server = server::serve_metrics(config.metrics_addr, Arc::clone(&metrics))
        .fuse()
        .boxed();

    let lock = config
        .leader_election
        .map(|election| LeaseLock::new(client.clone(), &election.namespace, election.lease));
    if let Some(lock) = lock.as_ref() {
        // Probes keep being served while another replica leads.
        let acquired = tokio::select! {
            acquired = lock.acquire(&signal) => acquired,
            res = &mut signal_task => {
                if let Err(e) = res {
                    error!("Signal task completed with error {:?}", &e);
                }
                false
            },
            _ = &mut probes => {
                error!("Health probe server has completed");
                false
            },
            _ = &mut metrics_server => {
                error!("Metrics server has completed");
                false
            },
        };
        if !acquired {
            return Ok(());
        }
    }
    let mut renewal: BoxFuture<'_, keda_manager::Result<()>> = match lock.as_ref() {
        Some(lock) => lock.hold(Arc::clone(&signal)).boxed(),
        None => future::pending().boxed(),
    };

    let mut controller = controller::run(client, fsm, Arc::clone(&metrics), Arc::clone(&health))
        .fuse()
        .boxed();

    let mut lost = None;
    let controller_done = tokio::select! {
        res = &mut signal_task => {
            if let Err(e) = res {
                error!("Signal task completed with error {:?}", &e);
            }
            false
        },
        _ = &mut controller => {
            warn!("Keda controller has completed");
            true
        },
        res = &mut renewal => {
            lost = res.err();
            false
        },
        _ = &mut probes => {
            error!("Health probe server has completed");
            false
        },
        _ = &mut metrics_server => {
            error!("Metrics server has completed");
            false
        },
    };
    // Use relaxed ordering because we just need other tasks to eventually catch the signal.
    signal.store(true, Ordering::Relaxed);

    if !controller_done && tokio::time::timeout(SHUTDOWN_GRACE, controller).await.is_err() {
        info!("Shutdown grace period elapsed");
    }
    if let Some(e) = lost {
        // Another replica may already be reconciling, exit without touching the lease.
        return Err(e.into());
    }
    if let Some(lock) = lock.as_ref() {
        if let Err(e) = lock.step_down().await {
            warn!(error = %e, "Failed to release leadership lease");
        }
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Console => builder.init(),
    }
}

/// Awaits SIGINT and sets graceful shutdown flag if detected.
async fn start_signal_task(signal: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrl_c().await?;
    warn!("Caught keyboard interrupt.");
    signal.store(true, Ordering::Relaxed);
    Ok(())
}
