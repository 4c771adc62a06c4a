//! Prometheus metrics of the reconciler.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use tracing::error;

/// Identifies one `Keda` resource.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Namespace of the resource.
    pub namespace: String,
    /// Name of the resource.
    pub name: String,
}

/// A `Keda` resource and one of its possible states.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    /// Namespace of the resource.
    pub namespace: String,
    /// Name of the resource.
    pub name: String,
    /// A `status.state` value.
    pub state: String,
}

const STATES: [&str; 4] = ["Processing", "Ready", "Error", "Deleting"];

fn state_labels(labels: &ReconcileLabels, state: &str) -> StateLabels {
    StateLabels {
        namespace: labels.namespace.clone(),
        name: labels.name.clone(),
        state: state.to_string(),
    }
}

/// Every metric keda-manager exports, with the registry serving them.
pub struct Metrics {
    /// Finished passes, successful or not.
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Passes that ended with an error.
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Wall time of a pass.
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// 1 for the state a resource was last seen in, 0 for the others.
    pub keda_state: Family<StateLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// A registry with every metric registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "keda_manager_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "keda_manager_reconciliation_errors",
            "Total number of failed reconciliations",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 12))
            });
        registry.register(
            "keda_manager_reconcile_duration_seconds",
            "Duration of one reconciliation pass in seconds",
            reconcile_duration_seconds.clone(),
        );

        let keda_state = Family::<StateLabels, Gauge>::default();
        registry.register(
            "keda_manager_keda_state",
            "State each Keda resource was last seen in",
            keda_state.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            keda_state,
            registry,
        }
    }

    /// Count a finished pass and observe its duration.
    pub fn record_reconcile(&self, labels: &ReconcileLabels, duration_secs: f64) {
        self.reconciliations_total.get_or_create(labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(labels)
            .observe(duration_secs);
    }

    /// Count a failed pass.
    pub fn record_error(&self, labels: &ReconcileLabels) {
        self.reconciliation_errors_total.get_or_create(labels).inc();
    }

    /// Mark `state` as the current state of the resource.
    pub fn set_state(&self, labels: &ReconcileLabels, state: &str) {
        for candidate in STATES {
            let value = if candidate == state { 1 } else { 0 };
            self.keda_state
                .get_or_create(&state_labels(labels, candidate))
                .set(value);
        }
    }

    /// Drop the state series of a resource that no longer exists.
    pub fn forget_state(&self, labels: &ReconcileLabels) {
        for candidate in STATES {
            self.keda_state.remove(&state_labels(labels, candidate));
        }
    }

    /// Encode metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        buffer
    }
}
