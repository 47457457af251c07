//! KronosApp CRD types
//!
//! A `KronosApp` describes a sleep window, the days and holidays it applies
//! to, and which workloads are put to sleep while it is active.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::inventory::resolve_kinds;
use crate::schedule::{parse_holiday_dates, parse_time_of_day, parse_timezone, parse_weekdays};
use crate::Error;

// =============================================================================
// Spec
// =============================================================================

/// A named holiday covering one or more calendar dates
///
/// `date` is `YYYY-MM-DD`, optionally followed by more days of the same
/// month separated by `/`, e.g. `2025-12-24/25/26`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Holiday {
    /// Holiday name
    pub name: String,
    /// Date notation
    pub date: String,
}

/// A rule selecting workloads to put to sleep
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncludedObject {
    /// `apps/v1`, `batch/v1` or `*`
    #[serde(default = "wildcard")]
    pub api_version: String,

    /// Deployment, StatefulSet, ReplicaSet, CronJob or `*`
    #[serde(default = "wildcard")]
    pub kind: String,

    /// Namespace to list workloads in; empty means all namespaces
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Regex a workload name must match
    #[serde(default = "default_include_ref")]
    pub include_ref: String,

    /// Regex a workload name must not match
    #[serde(default = "default_exclude_ref")]
    pub exclude_ref: String,
}

impl Default for IncludedObject {
    fn default() -> Self {
        Self {
            api_version: wildcard(),
            kind: wildcard(),
            namespace: default_namespace(),
            include_ref: default_include_ref(),
            exclude_ref: default_exclude_ref(),
        }
    }
}

fn wildcard() -> String {
    "*".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_include_ref() -> String {
    ".*".to_string()
}

fn default_exclude_ref() -> String {
    "^$".to_string()
}

/// Schedule-driven sleep/wake for a set of workloads
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.wecraft.tn",
    version = "v1alpha1",
    kind = "KronosApp",
    plural = "kronosapps",
    shortname = "ka",
    namespaced,
    status = "KronosAppStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Handled Resources","type":"integer","jsonPath":".status.handledResources"}"#,
    printcolumn = r#"{"name":"Next Operation","type":"string","jsonPath":".status.nextOperation"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KronosAppSpec {
    /// Wall-clock time the sleep window starts (HH:MM)
    pub start_sleep: String,

    /// Wall-clock time the sleep window ends (HH:MM); may be before start
    pub end_sleep: String,

    /// Days the window applies to: `*`, or e.g. `1-5` / `1,3,5` (1 = Monday)
    #[serde(default = "wildcard")]
    pub weekdays: String,

    /// IANA timezone name, UTC when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Holidays force sleep for the whole day
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holidays: Vec<Holiday>,

    /// Workload selection rules
    #[serde(default)]
    pub included_objects: Vec<IncludedObject>,

    /// Keep workloads awake regardless of the window (holidays still win)
    #[serde(default)]
    pub force_wake: bool,

    /// Keep workloads asleep regardless of the window
    #[serde(default)]
    pub force_sleep: bool,
}

impl KronosAppSpec {
    /// Validate the spec
    ///
    /// Uses the same parsers as the schedule evaluator and inventory, so
    /// anything accepted here is accepted during reconcile.
    pub fn validate(&self) -> Result<(), Error> {
        parse_time_of_day(&self.start_sleep)?;
        parse_time_of_day(&self.end_sleep)?;
        parse_weekdays(&self.weekdays)?;
        parse_timezone(self.timezone.as_deref())?;
        for holiday in &self.holidays {
            parse_holiday_dates(&holiday.name, &holiday.date)?;
        }

        for (index, rule) in self.included_objects.iter().enumerate() {
            resolve_kinds(rule).map_err(|e| {
                Error::validation(format!("includedObjects[{}]: {}", index, e))
            })?;
            for pattern in [&rule.include_ref, &rule.exclude_ref] {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::validation(format!(
                        "includedObjects[{}]: invalid pattern '{}': {}",
                        index, pattern, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Whether the managed workloads are currently running
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AppState {
    /// Workloads run normally
    #[default]
    Awake,
    /// Workloads are scaled to zero / suspended
    Asleep,
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Awake => write!(f, "Awake"),
            Self::Asleep => write!(f, "Asleep"),
        }
    }
}

/// Why the app is in its current state
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SleepReason {
    /// Weekday and time window rules
    #[default]
    Scheduled,
    /// Today is a holiday
    Holiday,
    /// `forceWake` is set
    ForceWake,
    /// `forceSleep` is set
    ForceSleep,
}

impl std::fmt::Display for SleepReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "Scheduled"),
            Self::Holiday => write!(f, "Holiday"),
            Self::ForceWake => write!(f, "ForceWake"),
            Self::ForceSleep => write!(f, "ForceSleep"),
        }
    }
}

/// Observed state of a KronosApp
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KronosAppStatus {
    /// Awake or Asleep
    #[serde(default)]
    pub status: AppState,

    /// Reason for the current status
    #[serde(default)]
    pub reason: SleepReason,

    /// Number of workloads matched by the selection rules
    #[serde(default)]
    pub handled_resources: u32,

    /// When the schedule will next be re-evaluated (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_operation: Option<String>,

    /// Saved-state secrets this app has created
    #[serde(
        default,
        rename = "secretCreated",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub created_secrets: Vec<String>,
}

impl KronosAppStatus {
    /// Whether `secret` was recorded as created by this app
    pub fn recorded_secret(&self, secret: &str) -> bool {
        self.created_secrets.iter().any(|s| s == secret)
    }

    /// Same decision as `other`, ignoring the audit list
    pub fn same_decision(&self, other: &KronosAppStatus) -> bool {
        self.status == other.status
            && self.reason == other.reason
            && self.handled_resources == other.handled_resources
            && self.next_operation == other.next_operation
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> KronosAppSpec {
        KronosAppSpec {
            start_sleep: "20:00".to_string(),
            end_sleep: "08:00".to_string(),
            weekdays: "1-5".to_string(),
            timezone: Some("Europe/Paris".to_string()),
            holidays: vec![Holiday {
                name: "Christmas".to_string(),
                date: "2025-12-24/25/26".to_string(),
            }],
            included_objects: vec![IncludedObject::default()],
            force_wake: false,
            force_sleep: false,
        }
    }

    #[test]
    fn minimal_spec_gets_defaults() {
        let spec: KronosAppSpec = serde_json::from_value(serde_json::json!({
            "startSleep": "19:00",
            "endSleep": "07:30",
            "includedObjects": [{}]
        }))
        .unwrap();

        assert_eq!(spec.weekdays, "*");
        assert!(spec.timezone.is_none());
        assert!(!spec.force_sleep);
        let rule = &spec.included_objects[0];
        assert_eq!(rule.api_version, "*");
        assert_eq!(rule.kind, "*");
        assert_eq!(rule.namespace, "default");
        assert_eq!(rule.include_ref, ".*");
        assert_eq!(rule.exclude_ref, "^$");
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn both_force_flags_are_accepted() {
        let mut spec = spec();
        spec.force_sleep = true;
        spec.force_wake = true;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn bad_time_is_rejected() {
        let mut spec = spec();
        spec.start_sleep = "25:00".to_string();
        assert!(matches!(
            spec.validate(),
            Err(Error::InvalidTimeOfDay(_))
        ));
    }

    #[test]
    fn bad_kind_is_rejected() {
        let mut spec = spec();
        spec.included_objects[0].api_version = "batch/v1".to_string();
        spec.included_objects[0].kind = "Deployment".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("includedObjects[0]"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let mut spec = spec();
        spec.included_objects[0].include_ref = "(".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn status_serializes_with_audit_list_key() {
        let status = KronosAppStatus {
            status: AppState::Asleep,
            reason: SleepReason::Holiday,
            handled_resources: 3,
            next_operation: Some("2025-01-04T00:00:00+00:00".to_string()),
            created_secrets: vec!["kronosapp-shop".to_string()],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "Asleep");
        assert_eq!(json["reason"], "Holiday");
        assert_eq!(json["handledResources"], 3);
        assert_eq!(json["secretCreated"][0], "kronosapp-shop");
        assert!(status.recorded_secret("kronosapp-shop"));
    }

    #[test]
    fn same_decision_ignores_audit_list() {
        let a = KronosAppStatus {
            created_secrets: vec!["kronosapp-a".to_string()],
            ..Default::default()
        };
        let b = KronosAppStatus::default();
        assert!(a.same_decision(&b));

        let c = KronosAppStatus {
            status: AppState::Asleep,
            ..Default::default()
        };
        assert!(!b.same_decision(&c));
    }

    #[test]
    fn display_matches_status_strings() {
        assert_eq!(AppState::Awake.to_string(), "Awake");
        assert_eq!(AppState::Asleep.to_string(), "Asleep");
        assert_eq!(SleepReason::ForceSleep.to_string(), "ForceSleep");
        assert_eq!(SleepReason::ForceWake.to_string(), "ForceWake");
    }
}
