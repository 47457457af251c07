//! End-to-end reconcile scenarios against an in-memory cluster
//!
//! These drive `reconcile` through the public API only. The fake cluster
//! keeps workloads, the saved-state Secret and published statuses in memory
//! so each story can check what a user would see afterwards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;

use kronos::controller::{reconcile, Context, KronosAppClient};
use kronos::crd::{AppState, Holiday, IncludedObject, KronosApp, KronosAppSpec, KronosAppStatus, SleepReason};
use kronos::inventory::{filter_by_pattern, InventoryClient};
use kronos::schedule::SleepSchedule;
use kronos::store::SecretClient;
use kronos::workload::{ResourceRef, ResourceState, WorkloadClient, WorkloadKind, WorkloadValue};
use kronos::Error;

const HOUR: u64 = 3600;

// =============================================================================
// In-memory cluster
// =============================================================================

type Key = (WorkloadKind, String, String);

#[derive(Default)]
struct FakeCluster {
    workloads: Mutex<BTreeMap<Key, WorkloadValue>>,
    secret: Mutex<Option<BTreeMap<String, Vec<u8>>>>,
    statuses: Mutex<Vec<KronosAppStatus>>,
    writes: AtomicUsize,
}

impl FakeCluster {
    fn with_secret() -> Arc<Self> {
        let cluster = Self::default();
        *cluster.secret.lock().unwrap() = Some(BTreeMap::new());
        Arc::new(cluster)
    }

    fn add(&self, kind: WorkloadKind, name: &str, value: WorkloadValue) {
        self.workloads
            .lock()
            .unwrap()
            .insert((kind, "shop".to_string(), name.to_string()), value);
    }

    fn value(&self, kind: WorkloadKind, name: &str) -> WorkloadValue {
        self.workloads.lock().unwrap()[&(kind, "shop".to_string(), name.to_string())]
    }

    fn save(&self, kind: WorkloadKind, entries: &[ResourceState]) {
        self.secret
            .lock()
            .unwrap()
            .get_or_insert_with(BTreeMap::new)
            .insert(kind.to_string(), serde_json::to_vec(entries).unwrap());
    }

    fn saved(&self, kind: WorkloadKind) -> Vec<ResourceState> {
        self.secret
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|data| data.get(kind.as_str()).cloned())
            .map(|raw| serde_json::from_slice(&raw).unwrap())
            .unwrap_or_default()
    }

    fn secret_is_empty(&self) -> bool {
        self.secret
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|data| data.is_empty())
    }

    fn last_status(&self) -> KronosAppStatus {
        self.statuses
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a status should have been published")
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn context(self: &Arc<Self>, now: DateTime<Utc>) -> Arc<Context> {
        Arc::new(
            Context::from_clients(self.clone(), self.clone(), self.clone(), self.clone())
                .with_clock(move || now),
        )
    }
}

fn not_found() -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "not found".to_string(),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

#[async_trait]
impl WorkloadClient for FakeCluster {
    async fn get_value(&self, reference: &ResourceRef) -> Result<WorkloadValue, Error> {
        self.workloads
            .lock()
            .unwrap()
            .get(&(
                reference.kind,
                reference.namespace.clone(),
                reference.name.clone(),
            ))
            .copied()
            .ok_or_else(not_found)
    }

    async fn set_value(&self, reference: &ResourceRef, value: WorkloadValue) -> Result<(), Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.workloads.lock().unwrap().insert(
            (
                reference.kind,
                reference.namespace.clone(),
                reference.name.clone(),
            ),
            value,
        );
        Ok(())
    }
}

#[async_trait]
impl InventoryClient for FakeCluster {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: &str,
    ) -> Result<Vec<ResourceState>, Error> {
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
            .map(|((k, ns, name), value)| {
                ResourceState::new(ResourceRef::new(*k, ns.clone(), name.clone()), *value)
            })
            .collect())
    }
}

#[async_trait]
impl SecretClient for FakeCluster {
    async fn get(
        &self,
        _name: &str,
        _namespace: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        Ok(self.secret.lock().unwrap().clone())
    }

    async fn create(&self, _name: &str, _namespace: &str) -> Result<(), Error> {
        self.secret.lock().unwrap().get_or_insert_with(BTreeMap::new);
        Ok(())
    }

    async fn write_key(
        &self,
        _name: &str,
        _namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        self.secret
            .lock()
            .unwrap()
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self, _name: &str, _namespace: &str) -> Result<(), Error> {
        *self.secret.lock().unwrap() = Some(BTreeMap::new());
        Ok(())
    }
}

#[async_trait]
impl KronosAppClient for FakeCluster {
    async fn patch_status(
        &self,
        _name: &str,
        _namespace: &str,
        status: &KronosAppStatus,
    ) -> Result<(), Error> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

fn replicas(replicas: i32) -> WorkloadValue {
    WorkloadValue::Replicas { replicas }
}

fn suspended(suspended: bool) -> WorkloadValue {
    WorkloadValue::Suspended { suspended }
}

fn entry(kind: WorkloadKind, name: &str, value: WorkloadValue) -> ResourceState {
    ResourceState::new(ResourceRef::new(kind, "shop", name), value)
}

fn spec(rules: Vec<IncludedObject>) -> KronosAppSpec {
    KronosAppSpec {
        start_sleep: "20:00".to_string(),
        end_sleep: "08:00".to_string(),
        weekdays: "*".to_string(),
        timezone: Some("UTC".to_string()),
        holidays: vec![],
        included_objects: rules,
        force_wake: false,
        force_sleep: false,
    }
}

fn everything_in_shop() -> IncludedObject {
    IncludedObject {
        namespace: "shop".to_string(),
        ..Default::default()
    }
}

fn app(spec: KronosAppSpec) -> Arc<KronosApp> {
    let mut app = KronosApp::new("shop", spec);
    app.metadata.namespace = Some("shop".to_string());
    Arc::new(app)
}

// =============================================================================
// Schedule scenarios
// =============================================================================

#[test]
fn overnight_window_at_ten_pm_sleeps_for_ten_hours() {
    let schedule = SleepSchedule::new(&spec(vec![]), at("2025-03-12T22:00:00Z")).unwrap();
    let eval = schedule.evaluate();
    assert!(eval.should_sleep);
    assert!(!eval.is_holiday);
    assert_eq!(schedule.next_requeue_delay(), Duration::from_secs(10 * HOUR));
}

#[test]
fn holiday_sleeps_regardless_of_weekday_and_window() {
    let mut spec = spec(vec![]);
    spec.weekdays = "6,7".to_string();
    spec.holidays = vec![Holiday {
        name: "NewYear".to_string(),
        date: "2025-01-01".to_string(),
    }];
    // Wednesday at noon: outside both the weekday set and the window
    let eval = SleepSchedule::new(&spec, at("2025-01-01T12:00:00Z"))
        .unwrap()
        .evaluate();
    assert!(eval.is_holiday);
    assert!(eval.should_sleep);
}

#[test]
fn consecutive_holidays_sleep_until_the_day_after_the_run() {
    let mut spec = spec(vec![]);
    spec.holidays = vec![Holiday {
        name: "NewYear".to_string(),
        date: "2025-01-01/02/03".to_string(),
    }];
    let now = at("2025-01-01T00:00:00Z");
    let eval = SleepSchedule::new(&spec, now).unwrap().evaluate();
    assert_eq!(
        now + chrono::TimeDelta::from_std(eval.holiday_backlog).unwrap(),
        at("2025-01-04T00:00:00Z")
    );
}

#[test]
fn identical_include_and_exclude_select_nothing() {
    let listed = vec![
        entry(WorkloadKind::Deployment, "api", replicas(1)),
        entry(WorkloadKind::Deployment, "web", replicas(1)),
    ];
    assert!(filter_by_pattern(listed, "api", "api").unwrap().is_empty());
}

// =============================================================================
// Reconcile stories
// =============================================================================

#[tokio::test]
async fn first_sight_creates_saved_state_then_sleeps() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.add(WorkloadKind::Deployment, "api", replicas(3));
    let ctx = cluster.context(at("2025-03-12T22:00:00Z"));
    let app = app(spec(vec![everything_in_shop()]));

    let action = reconcile(app.clone(), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert_eq!(
        cluster.last_status().created_secrets,
        vec!["kronosapp-shop".to_string()]
    );
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(3));

    let action = reconcile(app, ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(10 * HOUR)));
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(0));

    let status = cluster.last_status();
    assert_eq!(status.status, AppState::Asleep);
    assert_eq!(status.reason, SleepReason::Scheduled);
    assert_eq!(status.handled_resources, 1);
}

#[tokio::test]
async fn night_then_morning_restores_every_workload_exactly() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "api", replicas(3));
    cluster.add(WorkloadKind::StatefulSet, "db", replicas(2));
    cluster.add(WorkloadKind::CronJob, "report", suspended(false));
    let app = app(spec(vec![everything_in_shop()]));

    reconcile(app.clone(), cluster.context(at("2025-03-12T22:00:00Z")))
        .await
        .unwrap();
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(0));
    assert_eq!(cluster.value(WorkloadKind::StatefulSet, "db"), replicas(0));
    assert_eq!(cluster.value(WorkloadKind::CronJob, "report"), suspended(true));
    assert_eq!(
        cluster.saved(WorkloadKind::CronJob),
        vec![entry(WorkloadKind::CronJob, "report", suspended(false))]
    );

    // A fresh context stands in for an operator restart overnight
    let action = reconcile(app, cluster.context(at("2025-03-13T09:00:00Z")))
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(11 * HOUR)));
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(3));
    assert_eq!(cluster.value(WorkloadKind::StatefulSet, "db"), replicas(2));
    assert_eq!(cluster.value(WorkloadKind::CronJob, "report"), suspended(false));
    assert!(cluster.secret_is_empty());
    assert_eq!(cluster.last_status().status, AppState::Awake);
}

#[tokio::test]
async fn repeated_reconcile_while_asleep_changes_nothing() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "api", replicas(3));
    let app = app(spec(vec![everything_in_shop()]));
    let ctx = cluster.context(at("2025-03-12T22:00:00Z"));

    reconcile(app.clone(), ctx.clone()).await.unwrap();
    let writes = cluster.writes();
    let saved = cluster.saved(WorkloadKind::Deployment);

    reconcile(app, ctx).await.unwrap();
    assert_eq!(cluster.writes(), writes);
    assert_eq!(cluster.saved(WorkloadKind::Deployment), saved);
    assert_eq!(saved, vec![entry(WorkloadKind::Deployment, "api", replicas(3))]);
}

#[tokio::test]
async fn workload_already_at_zero_is_left_alone() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "idle", replicas(0));
    let app = app(spec(vec![everything_in_shop()]));

    reconcile(app.clone(), cluster.context(at("2025-03-12T22:00:00Z")))
        .await
        .unwrap();
    assert!(cluster.saved(WorkloadKind::Deployment).is_empty());

    reconcile(app, cluster.context(at("2025-03-13T09:00:00Z")))
        .await
        .unwrap();
    assert_eq!(cluster.value(WorkloadKind::Deployment, "idle"), replicas(0));
    assert_eq!(cluster.writes(), 0);
}

#[tokio::test]
async fn workload_leaving_selection_mid_sleep_is_woken_and_forgotten() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "api", replicas(0));
    cluster.add(WorkloadKind::Deployment, "legacy", replicas(0));
    cluster.add(WorkloadKind::Deployment, "web", replicas(2));
    cluster.save(
        WorkloadKind::Deployment,
        &[
            entry(WorkloadKind::Deployment, "api", replicas(3)),
            entry(WorkloadKind::Deployment, "legacy", replicas(5)),
        ],
    );

    let rule = IncludedObject {
        exclude_ref: "^legacy$".to_string(),
        ..everything_in_shop()
    };
    reconcile(app(spec(vec![rule])), cluster.context(at("2025-03-12T23:00:00Z")))
        .await
        .unwrap();

    assert_eq!(cluster.value(WorkloadKind::Deployment, "legacy"), replicas(5));
    assert_eq!(cluster.value(WorkloadKind::Deployment, "web"), replicas(0));
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(0));
    assert_eq!(
        cluster.saved(WorkloadKind::Deployment),
        vec![
            entry(WorkloadKind::Deployment, "api", replicas(3)),
            entry(WorkloadKind::Deployment, "web", replicas(2)),
        ]
    );
}

#[tokio::test]
async fn kind_dropped_from_rules_is_still_restored() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::CronJob, "report", suspended(true));
    cluster.add(WorkloadKind::Deployment, "api", replicas(3));
    cluster.save(
        WorkloadKind::CronJob,
        &[entry(WorkloadKind::CronJob, "report", suspended(false))],
    );

    let rule = IncludedObject {
        api_version: "apps/v1".to_string(),
        ..everything_in_shop()
    };
    reconcile(app(spec(vec![rule])), cluster.context(at("2025-03-12T23:00:00Z")))
        .await
        .unwrap();

    assert_eq!(cluster.value(WorkloadKind::CronJob, "report"), suspended(false));
    assert!(cluster.saved(WorkloadKind::CronJob).is_empty());
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(0));
}

#[tokio::test]
async fn equal_patterns_handle_nothing() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "api", replicas(3));
    let rule = IncludedObject {
        include_ref: "api".to_string(),
        exclude_ref: "api".to_string(),
        ..everything_in_shop()
    };

    reconcile(app(spec(vec![rule])), cluster.context(at("2025-03-12T22:00:00Z")))
        .await
        .unwrap();

    assert_eq!(cluster.last_status().handled_resources, 0);
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(3));
}

#[tokio::test]
async fn holiday_run_keeps_workloads_asleep_until_it_ends() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "api", replicas(3));
    let mut spec = spec(vec![everything_in_shop()]);
    spec.force_wake = true;
    spec.holidays = vec![Holiday {
        name: "NewYear".to_string(),
        date: "2025-01-01/02/03".to_string(),
    }];

    let action = reconcile(app(spec), cluster.context(at("2025-01-02T12:00:00Z")))
        .await
        .unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(36 * HOUR)));
    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(0));
    let status = cluster.last_status();
    assert_eq!(status.reason, SleepReason::Holiday);
    assert_eq!(status.next_operation.as_deref(), Some("2025-01-04T00:00:00Z"));
}

#[tokio::test]
async fn deleted_workload_does_not_block_wake() {
    let cluster = FakeCluster::with_secret();
    cluster.add(WorkloadKind::Deployment, "api", replicas(0));
    cluster.save(
        WorkloadKind::Deployment,
        &[
            entry(WorkloadKind::Deployment, "api", replicas(3)),
            entry(WorkloadKind::Deployment, "gone", replicas(1)),
        ],
    );

    reconcile(
        app(spec(vec![everything_in_shop()])),
        cluster.context(at("2025-03-13T09:00:00Z")),
    )
    .await
    .unwrap();

    assert_eq!(cluster.value(WorkloadKind::Deployment, "api"), replicas(3));
    assert!(cluster.secret_is_empty());
}
