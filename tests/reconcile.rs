mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use keda_manager::crd::{
    ConditionStatus, KedaSpec, LogFormat, LogLevel, LoggingCfg, LoggingMetricsSrvCfg,
    LoggingOperatorCfg, NameValue, Resources, State, TimeEncoding,
};
use keda_manager::error::{Error, PatchError};
use keda_manager::events::ACTION_DELETE;
use keda_manager::manifest::{kind_of, name_of};
use keda_manager::reconciler::{Field, Stage, SystemState, Target, FINALIZER};
use keda_manager::status::{
    CONDITION_TYPE_DELETED, CONDITION_TYPE_INSTALLED, REASON_APPLY_OBJ_ERROR,
    REASON_DELETED, REASON_DEPLOYMENT_UPDATE_ERR, REASON_RENDER_ERR, REASON_VERIFICATION,
    REASON_VERIFIED,
};
use serde_json::Value;
use statefn::{Directive, StateMachine, Transition};

const POLL: Duration = Duration::from_secs(5);

fn limits(cpu: &str) -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(
            vec![("cpu".to_string(), Quantity(cpu.to_string()))]
                .into_iter()
                .collect(),
        ),
        requests: None,
    }
}

fn installed_reason(cluster: &MemoryCluster) -> String {
    cluster
        .keda()
        .status
        .and_then(|s| s.condition(CONDITION_TYPE_INSTALLED).map(|c| c.reason.clone()))
        .unwrap_or_default()
}

async fn install(cluster: &Arc<MemoryCluster>) {
    let fsm = fsm(cluster);
    fsm.reconcile(cluster.keda()).await.unwrap();
    cluster.set_ready(OPERATOR, true);
    cluster.set_ready(METRICS_SERVER, true);
    assert_eq!(fsm.reconcile(cluster.keda()).await.unwrap(), Directive::Done);
    assert_eq!(cluster.keda().state(), Some(State::Ready));
}

#[tokio::test]
async fn fresh_install_waits_for_readiness() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    let fsm = fsm(&cluster);

    let directive = fsm.reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::RequeueAfter(POLL));

    let stored = cluster.keda();
    assert_eq!(stored.state(), Some(State::Processing));
    assert_eq!(installed_reason(&cluster), REASON_VERIFICATION);
    assert_eq!(
        stored.metadata.finalizers,
        Some(vec![FINALIZER.to_string()])
    );
    assert_eq!(cluster.object_count(), template().len());

    cluster.set_ready(OPERATOR, true);
    cluster.set_ready(METRICS_SERVER, true);
    assert_eq!(
        fsm.reconcile(cluster.keda()).await.unwrap(),
        Directive::Done
    );
    assert_eq!(cluster.keda().state(), Some(State::Ready));
    assert_eq!(installed_reason(&cluster), REASON_VERIFIED);
}

#[tokio::test]
async fn targets_are_applied_after_the_base_manifest() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    fsm(&cluster).reconcile(cluster.keda()).await.unwrap();

    let applied = cluster.applied();
    let first_deployment = applied
        .iter()
        .position(|(kind, _, _)| kind == "Deployment")
        .unwrap();
    assert!(applied[..first_deployment]
        .iter()
        .all(|(kind, _, _)| kind != "Deployment"));
    assert_eq!(
        applied[first_deployment..]
            .iter()
            .map(|(_, _, name)| name.as_str())
            .collect::<Vec<_>>(),
        vec![OPERATOR, METRICS_SERVER]
    );
}

#[tokio::test]
async fn second_pass_changes_nothing() {
    let spec = KedaSpec {
        logging: Some(LoggingCfg {
            operator: Some(LoggingOperatorCfg {
                level: Some(LogLevel::Debug),
                format: Some(LogFormat::Json),
                time_encoding: Some(TimeEncoding::Epoch),
            }),
            metrics_server: Some(LoggingMetricsSrvCfg {
                level: Some(LogLevel::Error),
            }),
        }),
        resources: Some(Resources {
            operator: Some(limits("171m")),
            metrics_server: Some(limits("250m")),
        }),
        env: vec![NameValue::new("a", "1")],
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    install(&cluster).await;

    let before = cluster.mutations();
    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::Done);
    assert_eq!(cluster.mutations(), before);
}

#[tokio::test]
async fn absent_configuration_keeps_rendered_defaults() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    let (_, state) = fsm(&cluster)
        .run(SystemState::new(cluster.keda()))
        .await
        .unwrap();
    assert!(state.changed.is_empty());

    for name in [OPERATOR, METRICS_SERVER] {
        let stored = cluster.object("Deployment", name).unwrap();
        assert_eq!(container(&stored), container(&template_deployment(name)));
    }
}

#[tokio::test]
async fn operator_logging_flags_are_replaced_in_place() {
    let spec = KedaSpec {
        logging: Some(LoggingCfg {
            operator: Some(LoggingOperatorCfg {
                level: Some(LogLevel::Debug),
                format: Some(LogFormat::Json),
                time_encoding: None,
            }),
            metrics_server: Some(LoggingMetricsSrvCfg {
                level: Some(LogLevel::Debug),
            }),
        }),
        ..Default::default()
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    fsm(&cluster).reconcile(cluster.keda()).await.unwrap();

    let operator = cluster.object("Deployment", OPERATOR).unwrap();
    assert_eq!(
        args(&operator),
        vec![
            "--leader-elect",
            "--zap-log-level=debug",
            "--zap-encoder=json",
            "--zap-time-encoding=rfc3339",
        ]
    );
    let metrics_server = cluster.object("Deployment", METRICS_SERVER).unwrap();
    assert_eq!(
        args(&metrics_server),
        vec![
            "/usr/local/bin/keda-adapter",
            "--secure-port=6443",
            "--logtostderr=true",
            "--v=4",
        ]
    );
}

#[tokio::test]
async fn operator_cpu_limit_is_applied() {
    let spec = KedaSpec {
        resources: Some(Resources {
            operator: Some(limits("171m")),
            metrics_server: None,
        }),
        ..Default::default()
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    fsm(&cluster).reconcile(cluster.keda()).await.unwrap();

    let operator = cluster.object("Deployment", OPERATOR).unwrap();
    assert_eq!(
        container(&operator)["resources"],
        serde_json::json!({ "limits": { "cpu": "171m" } })
    );
    let metrics_server = cluster.object("Deployment", METRICS_SERVER).unwrap();
    assert_eq!(
        container(&metrics_server)["resources"],
        container(&template_deployment(METRICS_SERVER))["resources"]
    );
}

#[tokio::test]
async fn install_follows_the_resource_namespace() {
    let cluster = MemoryCluster::with_keda(keda_in("keda", KedaSpec::default()));
    fsm(&cluster).reconcile(cluster.keda()).await.unwrap();

    let account = cluster.object("ServiceAccount", OPERATOR).unwrap();
    assert_eq!(account.metadata.namespace.as_deref(), Some("keda"));
    let binding = cluster.object("ClusterRoleBinding", OPERATOR).unwrap();
    assert_eq!(binding.data["subjects"][0]["namespace"], "keda");
    let api_service = cluster
        .object("APIService", "v1beta1.external.metrics.k8s.io")
        .unwrap();
    assert_eq!(api_service.data["spec"]["service"]["namespace"], "keda");
    let service = cluster.object("Service", METRICS_SERVER).unwrap();
    assert_eq!(service.metadata.namespace.as_deref(), Some("keda"));
}

#[tokio::test]
async fn requested_cpu_reaches_ready() {
    let requests = ResourceRequirements {
        limits: None,
        requests: Some(
            vec![("cpu".to_string(), Quantity("171m".to_string()))]
                .into_iter()
                .collect(),
        ),
    };
    let spec = KedaSpec {
        resources: Some(Resources {
            operator: Some(requests),
            metrics_server: None,
        }),
        ..Default::default()
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    install(&cluster).await;

    let operator = cluster.object("Deployment", OPERATOR).unwrap();
    assert_eq!(
        container(&operator)["resources"]["requests"]["cpu"],
        serde_json::json!("171m")
    );
}

#[tokio::test]
async fn env_is_merged_into_both_workloads() {
    let spec = KedaSpec {
        env: vec![NameValue::new("a", "1"), NameValue::new("b", "2")],
        ..Default::default()
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    let (_, state) = fsm(&cluster)
        .run(SystemState::new(cluster.keda()))
        .await
        .unwrap();
    assert!(state.changed.contains(&(Target::Operator, Field::Env)));
    assert!(state.changed.contains(&(Target::MetricsServer, Field::Env)));

    let operator = cluster.object("Deployment", OPERATOR).unwrap();
    assert_eq!(
        env(&operator),
        vec![
            ("WATCH_NAMESPACE".to_string(), Some(String::new())),
            ("POD_NAME".to_string(), None),
            ("a".to_string(), Some("1".to_string())),
            ("b".to_string(), Some("2".to_string())),
        ]
    );
    assert_eq!(
        container(&operator)["env"][1]["valueFrom"]["fieldRef"]["fieldPath"],
        "metadata.name"
    );

    let metrics_server = cluster.object("Deployment", METRICS_SERVER).unwrap();
    assert_eq!(
        env(&metrics_server),
        vec![
            ("WATCH_NAMESPACE".to_string(), Some(String::new())),
            ("a".to_string(), Some("1".to_string())),
            ("b".to_string(), Some("2".to_string())),
        ]
    );
}

fn target_containers(state: &SystemState) -> (Value, Value) {
    (
        container(state.object("Deployment", OPERATOR).unwrap()),
        container(state.object("Deployment", METRICS_SERVER).unwrap()),
    )
}

#[tokio::test]
async fn each_patch_stage_touches_only_its_field() {
    let spec = KedaSpec {
        logging: Some(LoggingCfg {
            operator: Some(LoggingOperatorCfg {
                level: Some(LogLevel::Error),
                ..Default::default()
            }),
            metrics_server: Some(LoggingMetricsSrvCfg {
                level: Some(LogLevel::Info),
            }),
        }),
        resources: Some(Resources {
            operator: Some(limits("500m")),
            metrics_server: Some(limits("300m")),
        }),
        env: vec![NameValue::new("a", "1")],
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    let fsm = fsm(&cluster);
    let mut state = SystemState::new(cluster.keda());

    let mut stage = Stage::Initialize;
    let mut snapshots = Vec::new();
    loop {
        match fsm.step(stage, &mut state).await {
            Transition::Next(next) => {
                if !state.objects.is_empty() {
                    snapshots.push((stage, target_containers(&state)));
                }
                stage = next;
            }
            Transition::Stop(_) => break,
            Transition::Fail { error, .. } => panic!("stage {} failed: {}", stage, error),
        }
    }

    let after = |wanted: Stage| {
        snapshots
            .iter()
            .find(|(stage, _)| *stage == wanted)
            .map(|(_, containers)| containers.clone())
            .unwrap()
    };
    let field_changes = |from: Stage, to: Stage| -> Vec<(&'static str, &'static str)> {
        let (before_op, before_ms) = after(from);
        let (after_op, after_ms) = after(to);
        let mut changes = Vec::new();
        for field in ["args", "resources", "env", "image", "command", "name"] {
            if before_op[field] != after_op[field] {
                changes.push(("operator", field));
            }
            if before_ms[field] != after_ms[field] {
                changes.push(("metrics-server", field));
            }
        }
        changes
    };

    assert_eq!(
        field_changes(Stage::ApplyManifest, Stage::OperatorLogging),
        vec![("operator", "args")]
    );
    assert_eq!(
        field_changes(Stage::OperatorLogging, Stage::OperatorResources),
        vec![("operator", "resources")]
    );
    assert_eq!(
        field_changes(Stage::OperatorResources, Stage::OperatorEnv),
        vec![("operator", "env")]
    );
    assert_eq!(
        field_changes(Stage::OperatorEnv, Stage::MetricsServerLogging),
        vec![("metrics-server", "args")]
    );
    assert_eq!(
        field_changes(Stage::MetricsServerLogging, Stage::MetricsServerResources),
        vec![("metrics-server", "resources")]
    );
    assert_eq!(
        field_changes(Stage::MetricsServerResources, Stage::MetricsServerEnv),
        vec![("metrics-server", "env")]
    );
    assert!(field_changes(Stage::MetricsServerEnv, Stage::Verify).is_empty());
}

#[tokio::test]
async fn readiness_follows_the_workloads() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    install(&cluster).await;

    cluster.set_ready(METRICS_SERVER, false);
    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::RequeueAfter(POLL));
    assert_eq!(cluster.keda().state(), Some(State::Processing));
    assert_eq!(installed_reason(&cluster), REASON_VERIFICATION);

    cluster.set_ready(METRICS_SERVER, true);
    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::Done);
    assert_eq!(cluster.keda().state(), Some(State::Ready));
}

#[tokio::test]
async fn patch_failure_stops_before_the_other_workload() {
    let mut template = template();
    let operator = template
        .iter_mut()
        .find(|o| kind_of(o) == "Deployment" && name_of(o) == OPERATOR)
        .unwrap();
    let containers = operator.data["spec"]["template"]["spec"]["containers"]
        .as_array_mut()
        .unwrap();
    let sidecar = serde_json::json!({ "name": "sidecar", "image": "busybox" });
    containers.push(sidecar);

    let spec = KedaSpec {
        resources: Some(Resources {
            operator: Some(limits("171m")),
            metrics_server: Some(limits("171m")),
        }),
        ..Default::default()
    };
    let cluster = MemoryCluster::with_keda(keda(spec));
    let error = fsm_with(&cluster, template)
        .reconcile(cluster.keda())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Patch(PatchError::ContainerCount(2))
    ));
    assert!(error.requeue());

    let stored = cluster.keda();
    assert_eq!(stored.state(), Some(State::Error));
    let installed = stored
        .status
        .as_ref()
        .and_then(|s| s.condition(CONDITION_TYPE_INSTALLED))
        .unwrap();
    assert_eq!(installed.status, ConditionStatus::False);
    assert_eq!(installed.reason, REASON_DEPLOYMENT_UPDATE_ERR);

    // The base manifest went out, neither target deployment did.
    assert_eq!(cluster.count("Deployment"), 0);
    assert!(cluster.object("ServiceAccount", OPERATOR).is_some());
}

#[tokio::test]
async fn apply_failure_is_recorded_and_retried() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    cluster.fail_apply_of("ClusterRoleBinding");

    let error = fsm(&cluster).reconcile(cluster.keda()).await.unwrap_err();
    assert!(matches!(error, Error::Apply { ref kind, .. } if kind == "ClusterRoleBinding"));
    assert!(error.requeue());
    assert_eq!(cluster.keda().state(), Some(State::Error));
    assert_eq!(installed_reason(&cluster), REASON_APPLY_OBJ_ERROR);
}

#[tokio::test]
async fn missing_target_is_a_deployment_update_error() {
    let template: Vec<_> = template()
        .into_iter()
        .filter(|o| !(kind_of(o) == "Deployment" && name_of(o) == METRICS_SERVER))
        .collect();
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));

    let error = fsm_with(&cluster, template)
        .reconcile(cluster.keda())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::Patch(PatchError::TargetMissing(ref name)) if name == METRICS_SERVER
    ));
    assert_eq!(cluster.keda().state(), Some(State::Error));
    assert_eq!(installed_reason(&cluster), REASON_DEPLOYMENT_UPDATE_ERR);
    // Nothing is applied from a bundle that lacks a target.
    assert!(cluster.applied().is_empty());
}

#[tokio::test]
async fn render_failure_is_not_retried() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    let error = fsm_with(&cluster, Vec::new())
        .reconcile(cluster.keda())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Render(_)));
    assert!(!error.requeue());
    assert_eq!(installed_reason(&cluster), REASON_RENDER_ERR);
    assert_eq!(cluster.object_count(), 0);
}

#[tokio::test]
async fn raised_signal_abandons_the_pass_without_writes() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    let fsm = fsm(&cluster).with_signal(Arc::new(AtomicBool::new(true)));
    let error = fsm.reconcile(cluster.keda()).await.unwrap_err();
    assert!(matches!(error, Error::Interrupted(_)));
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn raised_signal_cancels_a_hung_cluster_call() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    cluster.hang_reads();
    let signal = Arc::new(AtomicBool::new(false));
    let fsm = fsm(&cluster).with_signal(Arc::clone(&signal));
    let raise = Arc::clone(&signal);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        raise.store(true, Ordering::Relaxed);
    });

    let error = tokio::time::timeout(Duration::from_secs(5), fsm.reconcile(cluster.keda()))
        .await
        .expect("hung stage was not cancelled")
        .unwrap_err();
    assert!(matches!(error, Error::Interrupted(ref stage) if stage == "Verify"));
    assert!(cluster.status_writes().is_empty());
}

#[tokio::test]
async fn deletion_removes_everything_and_releases_the_finalizer() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    install(&cluster).await;
    assert_eq!(cluster.count("Deployment"), 2);

    cluster.mark_for_deletion();
    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::Done);

    assert_eq!(cluster.count("Deployment"), 0);
    assert_eq!(cluster.object_count(), 0);
    assert!(cluster.try_keda().is_none(), "finalizer was not released");

    let deleted = cluster.deleted();
    assert_eq!(deleted.first().map(|(kind, _, _)| kind.as_str()), Some("Deployment"));
    assert_eq!(
        deleted.last().map(|(kind, _, _)| kind.as_str()),
        Some("CustomResourceDefinition")
    );

    let last_status = cluster.status_writes().pop().unwrap();
    let deleted_condition = last_status.condition(CONDITION_TYPE_DELETED).unwrap();
    assert_eq!(deleted_condition.status, ConditionStatus::True);
    assert_eq!(last_status.state, Some(State::Deleting));
}

#[tokio::test]
async fn state_changes_are_published_as_events() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    let events = Arc::new(RecordingEvents::default());
    let fsm = fsm(&cluster).with_events(events.clone());

    fsm.reconcile(cluster.keda()).await.unwrap();
    // Still waiting, the status is unchanged and nothing new is announced.
    fsm.reconcile(cluster.keda()).await.unwrap();
    cluster.set_ready(OPERATOR, true);
    cluster.set_ready(METRICS_SERVER, true);
    fsm.reconcile(cluster.keda()).await.unwrap();
    cluster.mark_for_deletion();
    fsm.reconcile(cluster.keda()).await.unwrap();

    assert_eq!(
        events.reasons(),
        vec![REASON_VERIFICATION, REASON_VERIFIED, REASON_DELETED]
    );
    let (regarding, last) = events.all().pop().unwrap();
    assert_eq!(regarding, NAME);
    assert_eq!(last.action, ACTION_DELETE);
}

#[tokio::test]
async fn finalizer_is_kept_until_objects_are_gone() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    install(&cluster).await;
    cluster.linger_deletes(true);
    cluster.mark_for_deletion();

    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::RequeueAfter(POLL));
    let stored = cluster.keda();
    assert_eq!(stored.state(), Some(State::Deleting));
    assert_eq!(
        stored.metadata.finalizers,
        Some(vec![FINALIZER.to_string()])
    );

    cluster.release();
    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::Done);
    assert!(cluster.try_keda().is_none());
}

#[tokio::test]
async fn deletion_without_finalizer_is_a_no_op() {
    let cluster = MemoryCluster::with_keda(keda(KedaSpec::default()));
    cluster.mark_for_deletion();
    let directive = fsm(&cluster).reconcile(cluster.keda()).await.unwrap();
    assert_eq!(directive, Directive::Done);
    assert_eq!(cluster.mutations(), 0);
}
