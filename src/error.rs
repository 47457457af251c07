//! Error types for the Kronos operator
//!
//! Schedule and inventory errors abort a reconcile and are retried by the
//! controller's error policy. Per-resource mutation errors (`UpdateFailed`)
//! are collected by the engine instead of being propagated.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Kronos operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Timezone is not a known IANA name
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Start or end of the sleep window is not a HH:MM wall-clock time
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),

    /// A holiday date entry could not be parsed
    #[error("invalid date format for holiday '{holiday}': {date}")]
    InvalidHolidayFormat {
        /// Name of the holiday
        holiday: String,
        /// The offending date notation
        date: String,
    },

    /// Weekday expression does not match the accepted grammar
    #[error("invalid weekday expression: {0}")]
    InvalidWeekdayFormat(String),

    /// Validation error for KronosApp specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Listing workloads for the inventory failed
    #[error("failed to fetch {kind} in namespace '{namespace}': {message}")]
    InventoryFetchFailed {
        /// Workload kind being listed
        kind: String,
        /// Namespace being listed ("" for all namespaces)
        namespace: String,
        /// Underlying cause
        message: String,
    },

    /// Reading or writing a single workload failed
    #[error("failed to update {kind} {namespace}/{name}: {message}")]
    UpdateFailed {
        /// Workload kind
        kind: String,
        /// Workload name
        name: String,
        /// Workload namespace
        namespace: String,
        /// Underlying cause
        message: String,
    },

    /// Saved state for a kind could not be decoded
    #[error("saved state for {kind} is corrupt: {message}")]
    CorruptState {
        /// Kind whose saved entry failed to decode
        kind: String,
        /// Decoder message
        message: String,
    },

    /// The saved-state secret is gone although the app recorded creating it
    #[error("secret {0} was not found but is recorded as created, possible tampering or data loss")]
    SecretMissingButRecorded(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reconcile exceeded its deadline
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an update error for a single workload
    pub fn update_failed(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl std::fmt::Display,
    ) -> Self {
        Self::UpdateFailed {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            message: msg.to_string(),
        }
    }

    /// Create an inventory error for a kind/namespace listing
    pub fn inventory(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl std::fmt::Display,
    ) -> Self {
        Self::InventoryFetchFailed {
            kind: kind.into(),
            namespace: namespace.into(),
            message: msg.to_string(),
        }
    }

    /// Whether the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Whether this error comes from invalid user input in the schedule
    ///
    /// These are not fixed by retrying until the KronosApp spec changes.
    pub fn is_schedule_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTimezone(_)
                | Self::InvalidTimeOfDay(_)
                | Self::InvalidHolidayFormat { .. }
                | Self::InvalidWeekdayFormat(_)
                | Self::Validation(_)
        )
    }
}
