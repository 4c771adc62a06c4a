//! The `Keda` custom resource.

use std::fmt;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired configuration of a KEDA installation.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1alpha1",
    kind = "Keda",
    status = "KedaStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KedaSpec {
    /// Logging overrides for the two managed workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCfg>,
    /// Resource overrides for the two managed workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Environment variables injected into both workloads, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<NameValue>,
}

/// Logging overrides, per workload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingCfg {
    /// Flags of the keda operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<LoggingOperatorCfg>,
    /// Verbosity of the metrics server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_server: Option<LoggingMetricsSrvCfg>,
}

/// Logging of the keda operator, mapped onto its `--zap-*` flags.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingOperatorCfg {
    /// `--zap-log-level`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    /// `--zap-encoder`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,
    /// `--zap-time-encoding`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_encoding: Option<TimeEncoding>,
}

/// Logging of the metrics server.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingMetricsSrvCfg {
    /// Mapped onto the klog `--v` verbosity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

/// Log level shared by both workloads.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including debug output.
    Debug,
    /// Informational messages and errors.
    Info,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// klog verbosity used by the metrics server for this level.
    pub fn verbosity(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Info => 2,
            LogLevel::Debug => 4,
        }
    }
}

/// Encoder of the operator log.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human readable lines.
    Console,
}

/// Timestamp encoding of the operator log.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TimeEncoding {
    /// Seconds since the epoch as a float.
    Epoch,
    /// Milliseconds since the epoch.
    Millis,
    /// Nanoseconds since the epoch.
    Nano,
    /// ISO 8601 with millisecond precision.
    Iso8601,
    /// RFC 3339 with second precision.
    Rfc3339,
    /// RFC 3339 with nanosecond precision.
    Rfc3339nano,
}

// The flag values are the serde names, so Display goes through serde_json
// instead of repeating the table.
macro_rules! display_as_serde {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(serde_json::Value::String(s)) => f.write_str(&s),
                    _ => Err(fmt::Error),
                }
            }
        })*
    };
}

display_as_serde!(LogLevel, LogFormat, TimeEncoding);

/// Resource requirements, per workload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Replaces the requirements of the operator container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub operator: Option<ResourceRequirements>,
    /// Replaces the requirements of the metrics server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub metrics_server: Option<ResourceRequirements>,
}

/// A single environment variable.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct NameValue {
    /// Variable name.
    pub name: String,
    /// Literal value.
    pub value: String,
}

impl NameValue {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        NameValue {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Observed state of the installation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KedaStatus {
    /// Projection of `conditions`, see [`KedaStatus::project`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    /// At most one entry per condition type.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Summary of the conditions, see [`KedaStatus::project`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum State {
    /// Work on the installation is in progress.
    Processing,
    /// Keda is installed and both workloads are ready.
    Ready,
    /// The last pass failed.
    Error,
    /// The installation is being removed.
    Deleting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of a [`Condition`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Not known yet, e.g. while waiting for readiness.
    Unknown,
}

/// A typed status entry, keyed by `type`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// `Installed` or `Deleted`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Whether the condition holds.
    pub status: ConditionStatus,
    /// Machine readable cause, one of the `REASON_*` constants.
    pub reason: String,
    /// Human readable detail, e.g. the error text.
    #[serde(default)]
    pub message: String,
    /// Generation of the resource the condition was computed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// RFC 3339 time `status` last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

fn preserve_unknown_object(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
