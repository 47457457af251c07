//! KronosApp reconciliation controller
//!
//! Each reconcile is a single pass:
//!
//! 1. Make sure the saved-state Secret exists (create it and requeue if not)
//! 2. Validate the spec and evaluate the schedule at "now"
//! 3. Apply overrides: Holiday > ForceSleep > ForceWake > Scheduled
//! 4. List the selected workloads and publish the decision as status
//! 5. Sleep: put new workloads to sleep, keep already-saved ones, restore
//!    ones that left the selection
//! 6. Wake: restore every saved workload and purge the saved state
//!
//! Status is published before any workload is touched so it reflects the
//! decision even when a later step fails.
//!
//! A status whose decision matches the one already stored is not patched
//! again, so the controller's own status writes do not trigger another
//! reconcile in a loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{AppState, KronosApp, KronosAppStatus, SleepReason};
use crate::inventory::{fetch_included, InventoryClient, InventorySnapshot, KubeInventoryClient};
use crate::metrics::{OtelScheduleObserver, ReconcileTimer, ScheduleObserver};
use crate::schedule::{format_duration, Evaluation, SleepSchedule};
use crate::store::{secret_name, KubeSecretClient, SavedStateStore, SecretClient};
use crate::workload::{KubeWorkloadClient, ResourceState, WorkloadClient, WorkloadKind};
use crate::Error;

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "kronos-controller";

/// Requeue delay after some workloads could not be put to sleep
pub const RETRY_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Default upper bound on a single reconcile
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Status surface
// =============================================================================

/// Trait abstracting KronosApp status writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KronosAppClient: Send + Sync {
    /// Patch the status of a KronosApp
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &KronosAppStatus,
    ) -> Result<(), Error>;
}

/// Real KronosApp client backed by the Kubernetes API
pub struct KubeKronosAppClient {
    client: Client,
}

impl KubeKronosAppClient {
    /// Create a new KubeKronosAppClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KronosAppClient for KubeKronosAppClient {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &KronosAppStatus,
    ) -> Result<(), Error> {
        let api: Api<KronosApp> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Source of "now" for schedule evaluation
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared controller context
///
/// Every cluster interaction goes through a trait object so the engine can
/// run against mocks. Use [`Context::builder`] in production.
pub struct Context {
    /// Status writes
    pub apps: Arc<dyn KronosAppClient>,
    /// Workload reads and writes
    pub workloads: Arc<dyn WorkloadClient>,
    /// Workload listing
    pub inventory: Arc<dyn InventoryClient>,
    /// Saved-state Secret access
    pub secrets: Arc<dyn SecretClient>,
    /// Receives each published decision
    pub observer: Arc<dyn ScheduleObserver>,
    /// Upper bound on a single reconcile
    pub reconcile_timeout: Duration,
    clock: Clock,
}

impl Context {
    /// Create a builder for a Context backed by the given kube Client
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Equivalent to `Context::builder(client).build()`
    pub fn new(client: Client) -> Self {
        Self::builder(client).build()
    }

    /// Assemble a Context from explicit clients
    ///
    /// Uses the OpenTelemetry observer, the default timeout and the system
    /// clock.
    pub fn from_clients(
        apps: Arc<dyn KronosAppClient>,
        workloads: Arc<dyn WorkloadClient>,
        inventory: Arc<dyn InventoryClient>,
        secrets: Arc<dyn SecretClient>,
    ) -> Self {
        Self {
            apps,
            workloads,
            inventory,
            secrets,
            observer: Arc::new(OtelScheduleObserver),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the decision observer
    pub fn with_observer(mut self, observer: Arc<dyn ScheduleObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the reconcile timeout
    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Current instant according to the clock
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    reconcile_timeout: Duration,
    observer: Option<Arc<dyn ScheduleObserver>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            observer: None,
        }
    }

    /// Set the upper bound on a single reconcile
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Override the decision observer
    pub fn observer(mut self, observer: Arc<dyn ScheduleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let ctx = Context::from_clients(
            Arc::new(KubeKronosAppClient::new(self.client.clone())),
            Arc::new(KubeWorkloadClient::new(self.client.clone())),
            Arc::new(KubeInventoryClient::new(self.client.clone())),
            Arc::new(KubeSecretClient::new(self.client)),
        )
        .with_reconcile_timeout(self.reconcile_timeout);

        match self.observer {
            Some(observer) => ctx.with_observer(observer),
            None => ctx,
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Final sleep decision after overrides
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Workloads should be asleep
    pub should_sleep: bool,
    /// What decided it
    pub reason: SleepReason,
}

impl Decision {
    /// Apply overrides to a schedule evaluation
    ///
    /// Precedence: Holiday > ForceSleep > ForceWake > Scheduled.
    pub fn resolve(eval: &Evaluation, force_sleep: bool, force_wake: bool) -> Self {
        if eval.is_holiday {
            Self {
                should_sleep: true,
                reason: SleepReason::Holiday,
            }
        } else if force_sleep {
            Self {
                should_sleep: true,
                reason: SleepReason::ForceSleep,
            }
        } else if force_wake {
            Self {
                should_sleep: false,
                reason: SleepReason::ForceWake,
            }
        } else {
            Self {
                should_sleep: eval.should_sleep,
                reason: SleepReason::Scheduled,
            }
        }
    }

    /// Resulting app state
    pub fn state(&self) -> AppState {
        if self.should_sleep {
            AppState::Asleep
        } else {
            AppState::Awake
        }
    }
}

// =============================================================================
// Failure report
// =============================================================================

/// Workloads that could not be updated during one pass, by kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FailureReport {
    by_kind: BTreeMap<WorkloadKind, Vec<String>>,
}

impl FailureReport {
    /// Record a failed workload
    pub fn record(&mut self, kind: WorkloadKind, name: impl Into<String>) {
        self.by_kind.entry(kind).or_default().push(name.into());
    }

    /// Whether nothing failed
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Number of failed workloads
    pub fn total(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// Names of failed workloads of `kind`
    pub fn for_kind(&self, kind: WorkloadKind) -> &[String] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn log(&self) {
        for (kind, names) in &self.by_kind {
            warn!(kind = %kind, failed = ?names, "workloads could not be updated");
        }
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile a KronosApp
///
/// Bounded by the context's reconcile timeout. Returns the delay until the
/// schedule next needs evaluating, or a short retry when workloads failed.
#[instrument(
    skip(app, ctx),
    fields(app = %app.name_any(), namespace = %app.namespace().unwrap_or_default())
)]
pub async fn reconcile(app: Arc<KronosApp>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();
    let result = match tokio::time::timeout(ctx.reconcile_timeout, reconcile_app(&app, &ctx)).await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(ctx.reconcile_timeout)),
    };

    match result {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(e) => {
            timer.error();
            Err(e)
        }
    }
}

/// Error policy for the controller
pub fn error_policy(app: Arc<KronosApp>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_schedule_error() {
        warn!(
            app = %app.name_any(),
            error = %error,
            "KronosApp spec is invalid"
        );
    } else {
        error!(
            ?error,
            app = %app.name_any(),
            "reconciliation failed"
        );
    }
    Action::requeue(ERROR_REQUEUE)
}

async fn reconcile_app(app: &KronosApp, ctx: &Context) -> Result<Action, Error> {
    let name = app.name_any();
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    let current = app.status.clone().unwrap_or_default();

    let Some(mut store) = SavedStateStore::open(ctx.secrets.clone(), &name, &namespace).await?
    else {
        return bootstrap(ctx, &name, &namespace, &current).await;
    };
    debug!(secret = %store.name(), "saved state found");

    app.spec.validate()?;

    let now = ctx.now();
    let schedule = SleepSchedule::new(&app.spec, now)?;
    let eval = schedule.evaluate();
    let decision = Decision::resolve(&eval, app.spec.force_sleep, app.spec.force_wake);

    let delay = if eval.is_holiday {
        info!(
            holiday = schedule.current_holiday().unwrap_or_default(),
            requeue = %format_duration(eval.holiday_backlog),
            "in holiday"
        );
        eval.holiday_backlog
    } else {
        let delay = schedule.next_requeue_delay();
        debug!(requeue = %format_duration(delay), "next schedule transition");
        delay
    };

    let inventory = fetch_included(ctx.inventory.as_ref(), &app.spec.included_objects).await?;
    info!(
        total = inventory.total(),
        kinds = ?inventory.counts(),
        "fetched selected workloads"
    );

    let status = KronosAppStatus {
        status: decision.state(),
        reason: decision.reason,
        handled_resources: u32::try_from(inventory.total()).unwrap_or(u32::MAX),
        next_operation: Some(next_operation(now, delay)),
        created_secrets: current.created_secrets.clone(),
    };
    publish_status(ctx, &name, &namespace, app.status.as_ref(), &status).await?;
    let previous = app
        .status
        .as_ref()
        .filter(|published| published.next_operation.is_some())
        .map(|published| (published.status, published.reason));
    ctx.observer.observe(&name, &namespace, previous, &status);

    info!(
        status = %status.status,
        reason = %status.reason,
        "schedule evaluated"
    );

    if decision.should_sleep {
        let failures = sleep_workloads(ctx, &mut store, &inventory).await?;
        if !failures.is_empty() {
            failures.log();
            return Ok(Action::requeue(RETRY_REQUEUE));
        }
    } else {
        wake_workloads(ctx, &mut store).await?;
    }

    Ok(Action::requeue(delay))
}

/// Create the saved-state Secret and record it in status
async fn bootstrap(
    ctx: &Context,
    name: &str,
    namespace: &str,
    current: &KronosAppStatus,
) -> Result<Action, Error> {
    let secret = secret_name(name);
    let recorded = current.recorded_secret(&secret);
    if recorded {
        let warning = Error::SecretMissingButRecorded(secret.clone());
        warn!(error = %warning, "recreating saved-state secret");
    }

    ctx.secrets.create(&secret, namespace).await?;
    info!(secret = %secret, "created saved-state secret");

    if !recorded {
        let mut status = current.clone();
        status.created_secrets.push(secret);
        ctx.apps.patch_status(name, namespace, &status).await?;
    }

    Ok(Action::requeue(Duration::ZERO))
}

async fn publish_status(
    ctx: &Context,
    name: &str,
    namespace: &str,
    current: Option<&KronosAppStatus>,
    status: &KronosAppStatus,
) -> Result<(), Error> {
    if current.is_some_and(|current| current.same_decision(status)) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    ctx.apps.patch_status(name, namespace, status).await
}

fn next_operation(now: DateTime<Utc>, delay: Duration) -> String {
    let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero());
    (now + delay).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Sleep branch
///
/// Walks every kind that is either selected now or still has saved entries,
/// so entries for kinds that left the selection are restored too.
async fn sleep_workloads(
    ctx: &Context,
    store: &mut SavedStateStore,
    inventory: &InventorySnapshot,
) -> Result<FailureReport, Error> {
    let workloads = ctx.workloads.as_ref();
    let mut failures = FailureReport::default();

    let mut kinds: BTreeSet<WorkloadKind> = inventory.kinds().collect();
    kinds.extend(store.kinds_with_data());

    for kind in kinds {
        let prior = store.load(kind)?;
        let selected = inventory.get(kind);
        let is_selected = |entry: &ResourceState| {
            selected
                .iter()
                .any(|r| r.reference.same_object(&entry.reference))
        };
        let was_saved = |resource: &ResourceState| {
            prior
                .iter()
                .any(|p| p.reference.same_object(&resource.reference))
        };

        let mut saved: Vec<ResourceState> =
            prior.iter().filter(|p| is_selected(*p)).cloned().collect();

        for resource in selected.iter().filter(|r| !was_saved(*r)) {
            match resource.sleep(workloads).await {
                Ok(Some(previous)) => {
                    saved.push(ResourceState::new(resource.reference.clone(), previous));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "failed to put workload to sleep");
                    failures.record(kind, &resource.reference.name);
                }
            }
        }

        for entry in prior.iter().filter(|p| !is_selected(*p)) {
            match entry.wake(workloads).await {
                Ok(()) => {
                    info!(workload = %entry.reference, "restored workload that left the selection");
                }
                Err(e) => {
                    warn!(error = %e, "failed to restore workload that left the selection");
                    failures.record(kind, &entry.reference.name);
                    saved.push(entry.clone());
                }
            }
        }

        store.save(kind, &saved).await?;
    }

    Ok(failures)
}

/// Wake branch
///
/// Every kind is decoded before anything is written, so corrupt state
/// aborts without touching workloads. Saved state is purged even when some
/// workloads fail to wake.
async fn wake_workloads(ctx: &Context, store: &mut SavedStateStore) -> Result<(), Error> {
    if store.is_empty() {
        debug!("nothing saved, workloads already awake");
        return Ok(());
    }

    let mut saved = Vec::new();
    for kind in store.kinds_with_data() {
        saved.extend(store.load(kind)?);
    }

    let mut failures = FailureReport::default();
    for entry in &saved {
        if let Err(e) = entry.wake(ctx.workloads.as_ref()).await {
            warn!(error = %e, "failed to wake workload");
            failures.record(entry.reference.kind, &entry.reference.name);
        }
    }
    if !failures.is_empty() {
        failures.log();
    }

    store.purge().await?;
    info!(
        restored = saved.len() - failures.total(),
        failed = failures.total(),
        "woke workloads"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
