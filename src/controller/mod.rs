//! Kubernetes controllers for Kronos CRDs
//!
//! The KronosApp controller evaluates each app's schedule and drives its
//! selected workloads between Awake and Asleep.

mod kronos_app;

pub use kronos_app::{
    error_policy, reconcile, Clock, Context, ContextBuilder, Decision, FailureReport,
    KronosAppClient, KubeKronosAppClient, DEFAULT_RECONCILE_TIMEOUT, ERROR_REQUEUE,
    FIELD_MANAGER, RETRY_REQUEUE,
};

#[cfg(test)]
pub use kronos_app::MockKronosAppClient;
