//! Kronos - Kubernetes operator that puts workloads to sleep on a schedule
//!
//! A `KronosApp` names a set of workloads and a recurring sleep window.
//! While the window is open (or on a holiday, or when forced) the workloads
//! are scaled to zero or suspended; when it closes they are restored to
//! exactly the values they had before.
//!
//! # Modules
//!
//! - [`crd`] - The KronosApp Custom Resource Definition
//! - [`schedule`] - Sleep window, weekday and holiday evaluation
//! - [`workload`] - Scalable and suspendable workload handling
//! - [`inventory`] - Selection of workloads by kind, namespace and name
//! - [`store`] - Saved pre-sleep state, kept in one Secret per app
//! - [`controller`] - Reconciliation of KronosApps
//! - [`metrics`] - OpenTelemetry instruments
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod schedule;
pub mod store;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
