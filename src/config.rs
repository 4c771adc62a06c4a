//! Configuration for keda-manager
//!
//! Every option is a command line flag with an environment variable
//! fallback. Use [`Config::new_from_flags`] in the binary and
//! [`Config::default`] everywhere else.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use structopt::StructOpt;

use crate::leader::{LeaseLockParams, LEASE_DURATION, LEASE_NAME};
use crate::reconciler::{
    ReconcilerConfig, DEFAULT_METRICS_SERVER_DEPLOYMENT, DEFAULT_OPERATOR_DEPLOYMENT,
};

const DEFAULT_MANIFEST: &str = "keda-manager.yaml";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "kyma-system";

/// Output format of the process log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human readable lines
    Console,
}

/// Where and as whom leadership is claimed.
#[derive(Clone, Debug)]
pub struct LeaderElection {
    /// Namespace holding the Lease
    pub namespace: String,
    /// Lease name, holder identity and duration
    pub lease: LeaseLockParams,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "console" => Ok(LogFormat::Console),
            other => Err(format!("unknown log format {:?}, expected json or console", other)),
        }
    }
}

/// The configuration needed for keda-manager to run.
#[derive(Clone, Debug)]
pub struct Config {
    /// The manifest bundle rendered for every `Keda` resource
    pub manifest: PathBuf,
    /// Where `/metrics` is served
    pub metrics_addr: SocketAddr,
    /// Where `/healthz` and `/readyz` are served
    pub probe_addr: SocketAddr,
    /// Settings of every reconciliation pass
    pub reconciler: ReconcilerConfig,
    /// Default filter directive, overridden by `RUST_LOG`
    pub log_level: String,
    /// Output format of the process log
    pub log_format: LogFormat,
    /// Set when only the leader among replicas may reconcile
    pub leader_election: Option<LeaderElection>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            metrics_addr: ([0, 0, 0, 0], 8080).into(),
            probe_addr: ([0, 0, 0, 0], 8081).into(),
            reconciler: ReconcilerConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            leader_election: None,
        }
    }
}

impl Config {
    /// Parses all command line flags and sets the proper defaults.
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        Opts::from_clap(&app.get_matches()).into()
    }
}

/// The pod name when running in a cluster, otherwise the host name.
fn default_holder_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| format!("keda-manager-{}", std::process::id()))
}

impl From<Opts> for Config {
    fn from(opts: Opts) -> Self {
        let leader_election = if opts.leader_elect {
            Some(LeaderElection {
                namespace: opts.leader_election_namespace,
                lease: LeaseLockParams {
                    holder_id: opts.leader_election_id.unwrap_or_else(default_holder_id),
                    lease_name: LEASE_NAME.to_string(),
                    lease_ttl: LEASE_DURATION,
                },
            })
        } else {
            None
        };
        Config {
            manifest: opts.manifest,
            metrics_addr: opts.metrics_addr,
            probe_addr: opts.probe_addr,
            reconciler: ReconcilerConfig {
                operator_deployment: opts.operator_deployment,
                metrics_server_deployment: opts.metrics_server_deployment,
                ready_poll_interval: Duration::from_secs(opts.ready_poll_interval),
                max_steps: opts.max_steps,
            },
            log_level: opts.log_level,
            log_format: opts.log_format,
            leader_election,
        }
    }
}

/// CLI options that can be configured for keda-manager
#[derive(StructOpt, Clone, Debug)]
#[structopt(
    name = "keda-manager",
    about = "Installs and configures Keda from a Keda custom resource"
)]
pub struct Opts {
    #[structopt(
        long = "manifest",
        default_value = DEFAULT_MANIFEST,
        env = "KEDA_MANAGER_MANIFEST",
        help = "Path to the Keda manifest bundle"
    )]
    manifest: PathBuf,

    #[structopt(
        long = "metrics-bind-address",
        default_value = DEFAULT_METRICS_ADDR,
        env = "METRICS_BIND_ADDRESS",
        help = "The address the metrics endpoint binds to"
    )]
    metrics_addr: SocketAddr,

    #[structopt(
        long = "health-probe-bind-address",
        default_value = DEFAULT_PROBE_ADDR,
        env = "HEALTH_PROBE_BIND_ADDRESS",
        help = "The address the probe endpoints bind to"
    )]
    probe_addr: SocketAddr,

    #[structopt(
        long = "operator-deployment",
        default_value = DEFAULT_OPERATOR_DEPLOYMENT,
        env = "KEDA_OPERATOR_DEPLOYMENT",
        help = "Name of the Keda operator deployment in the manifest"
    )]
    operator_deployment: String,

    #[structopt(
        long = "metrics-server-deployment",
        default_value = DEFAULT_METRICS_SERVER_DEPLOYMENT,
        env = "KEDA_METRICS_SERVER_DEPLOYMENT",
        help = "Name of the Keda metrics server deployment in the manifest"
    )]
    metrics_server_deployment: String,

    #[structopt(
        long = "ready-poll-interval",
        default_value = "5",
        env = "READY_POLL_INTERVAL",
        help = "Seconds to wait before checking readiness or removal again"
    )]
    ready_poll_interval: u64,

    #[structopt(
        long = "max-steps",
        default_value = "64",
        env = "MAX_STEPS",
        help = "Upper bound on the stages one reconciliation may run"
    )]
    max_steps: usize,

    #[structopt(
        long = "log-level",
        default_value = "info",
        env = "LOG_LEVEL",
        help = "Default log filter, RUST_LOG takes precedence"
    )]
    log_level: String,

    #[structopt(
        long = "log-format",
        default_value = "json",
        env = "LOG_FORMAT",
        possible_values = &["json", "console"],
        help = "Log output format"
    )]
    log_format: LogFormat,

    #[structopt(
        long = "leader-elect",
        help = "Only reconcile while holding the leader lease, for running several replicas"
    )]
    leader_elect: bool,

    #[structopt(
        long = "leader-election-namespace",
        default_value = DEFAULT_LEADER_ELECTION_NAMESPACE,
        env = "POD_NAMESPACE",
        help = "Namespace of the leader lease"
    )]
    leader_election_namespace: String,

    #[structopt(
        long = "leader-election-id",
        env = "POD_NAME",
        help = "Identity written into the leader lease, defaults to the host name"
    )]
    leader_election_id: Option<String>,
}
