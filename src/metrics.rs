//! Metrics for Kronos observability
//!
//! OpenTelemetry instruments on the global meter. Exporting is left to
//! whatever meter provider the process installs; without one the
//! instruments are no-ops.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

#[cfg(test)]
use mockall::automock;

use crate::crd::{AppState, KronosAppStatus, SleepReason};

/// Global meter for Kronos metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("kronos"));

/// Gauge of the current schedule state per app: 0 asleep, 1 awake
///
/// Labels:
/// - `name`, `namespace`: the KronosApp
pub static SCHEDULE_INFO: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("kronos_schedule_info")
        .with_description("Schedule state of a KronosApp (0 asleep, 1 awake)")
        .build()
});

/// Info gauge of the current decision per app
///
/// The series for the current status and reason reads 1. The series of the
/// previous decision is set back to 0 when the decision changes.
///
/// Labels:
/// - `name`, `namespace`: the KronosApp
/// - `status`: Awake, Asleep
/// - `reason`: Scheduled, Holiday, ForceWake, ForceSleep
pub static SCHEDULE_DECISION: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("kronos_schedule_decision")
        .with_description("Current decision of a KronosApp (1 current, 0 superseded)")
        .build()
});

/// Gauge of workloads selected per app
///
/// Labels:
/// - `name`, `namespace`: the KronosApp
pub static HANDLED_RESOURCES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("kronos_handled_resources")
        .with_description("Number of workloads selected by a KronosApp")
        .with_unit("{resources}")
        .build()
});

/// Histogram of reconcile duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kronos_reconcile_duration_seconds")
        .with_description("Duration of KronosApp reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// State and reason of a published decision
pub type DecisionLabels = (AppState, SleepReason);

/// Receives each schedule decision the engine publishes
#[cfg_attr(test, automock)]
pub trait ScheduleObserver: Send + Sync {
    /// Record the decision for one app
    ///
    /// `previous` is the decision found in the app's status before this
    /// reconcile, if any.
    fn observe(
        &self,
        name: &str,
        namespace: &str,
        previous: Option<DecisionLabels>,
        status: &KronosAppStatus,
    );
}

/// Observer that records to the OpenTelemetry instruments
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelScheduleObserver;

impl ScheduleObserver for OtelScheduleObserver {
    fn observe(
        &self,
        name: &str,
        namespace: &str,
        previous: Option<DecisionLabels>,
        status: &KronosAppStatus,
    ) {
        let app = [
            KeyValue::new("name", name.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
        ];
        SCHEDULE_INFO.record(schedule_value(status.status), &app);
        HANDLED_RESOURCES.record(i64::from(status.handled_resources), &app);

        let current = (status.status, status.reason);
        if let Some(previous) = previous.filter(|previous| *previous != current) {
            SCHEDULE_DECISION.record(0, &decision_labels(&app, previous));
        }
        SCHEDULE_DECISION.record(1, &decision_labels(&app, current));
    }
}

fn decision_labels(app: &[KeyValue], (state, reason): DecisionLabels) -> Vec<KeyValue> {
    let mut labels = app.to_vec();
    labels.push(KeyValue::new("status", state.to_string()));
    labels.push(KeyValue::new("reason", reason.to_string()));
    labels
}

/// Gauge value for a state: 0 asleep, 1 awake
pub fn schedule_value(state: AppState) -> i64 {
    match state {
        AppState::Asleep => 0,
        AppState::Awake => 1,
    }
}

/// Times one reconcile
pub struct ReconcileTimer {
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record a successful reconcile
    pub fn success(self) {
        self.finish("success");
    }

    /// Record a failed reconcile
    pub fn error(self) {
        self.finish("error");
    }

    fn finish(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}
