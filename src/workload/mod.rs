//! Workload abstraction
//!
//! Kronos manages two shapes of workload: scalable ones (Deployment,
//! StatefulSet, ReplicaSet) sleep by scaling to zero replicas, toggleable
//! ones (CronJob) sleep by setting `spec.suspend`. Both are driven through
//! the [`WorkloadClient`] seam so the engine can be tested without a cluster.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

// =============================================================================
// Kinds
// =============================================================================

/// Workload kinds Kronos can put to sleep
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// batch/v1 CronJob
    CronJob,
}

impl WorkloadKind {
    /// Every supported kind
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::ReplicaSet,
        WorkloadKind::CronJob,
    ];

    /// Kind name as used in manifests and saved-state keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::CronJob => "CronJob",
        }
    }

    /// API group/version serving this kind
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Deployment | Self::StatefulSet | Self::ReplicaSet => "apps/v1",
            Self::CronJob => "batch/v1",
        }
    }

    /// Whether the kind sleeps by scaling replicas (otherwise by suspending)
    pub fn is_scalable(&self) -> bool {
        !matches!(self, Self::CronJob)
    }

    /// Value a workload of this kind holds while asleep
    pub fn sleeping_value(&self) -> WorkloadValue {
        if self.is_scalable() {
            WorkloadValue::Replicas { replicas: 0 }
        } else {
            WorkloadValue::Suspended { suspended: true }
        }
    }

    /// Whether `value` is the right shape for this kind
    pub fn accepts(&self, value: &WorkloadValue) -> bool {
        matches!(
            (self.is_scalable(), value),
            (true, WorkloadValue::Replicas { .. }) | (false, WorkloadValue::Suspended { .. })
        )
    }

    /// Erased API resource for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Deployment => ApiResource::erase::<Deployment>(&()),
            Self::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
            Self::ReplicaSet => ApiResource::erase::<ReplicaSet>(&()),
            Self::CronJob => ApiResource::erase::<CronJob>(&()),
        }
    }

    /// Read the sleep-relevant value from an object's raw body
    ///
    /// Missing `spec.replicas` means the API default of 1; missing
    /// `spec.suspend` means not suspended.
    pub fn read_value(&self, data: &serde_json::Value) -> WorkloadValue {
        let spec = &data["spec"];
        if self.is_scalable() {
            let replicas = spec["replicas"]
                .as_i64()
                .and_then(|r| i32::try_from(r).ok())
                .unwrap_or(1);
            WorkloadValue::Replicas { replicas }
        } else {
            WorkloadValue::Suspended {
                suspended: spec["suspend"].as_bool().unwrap_or(false),
            }
        }
    }

    /// Merge patch that sets `value` on an object of this kind
    pub fn patch_for(&self, value: WorkloadValue) -> Result<serde_json::Value, Error> {
        match value {
            WorkloadValue::Replicas { replicas } if self.is_scalable() => {
                Ok(json!({ "spec": { "replicas": replicas } }))
            }
            WorkloadValue::Suspended { suspended } if !self.is_scalable() => {
                Ok(json!({ "spec": { "suspend": suspended } }))
            }
            other => Err(Error::validation(format!(
                "{} cannot hold value {:?}",
                self, other
            ))),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unsupported kind: {}", s)))
    }
}

// =============================================================================
// Resource state
// =============================================================================

/// Identity of a watched workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Object name
    pub name: String,
    /// Workload kind
    pub kind: WorkloadKind,
    /// Object namespace
    pub namespace: String,
}

impl ResourceRef {
    /// Create a reference
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            namespace: namespace.into(),
        }
    }

    /// Same object as `other` (name and namespace, within a kind)
    pub fn same_object(&self, other: &ResourceRef) -> bool {
        self.name == other.name && self.namespace == other.namespace
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Sleep-relevant value of a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkloadValue {
    /// Replica count of a scalable workload
    Replicas {
        /// Desired replicas
        replicas: i32,
    },
    /// Suspend flag of a toggleable workload
    Suspended {
        /// Whether scheduling is suspended
        suspended: bool,
    },
}

impl fmt::Display for WorkloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicas { replicas } => write!(f, "replicas={}", replicas),
            Self::Suspended { suspended } => write!(f, "suspended={}", suspended),
        }
    }
}

/// A workload together with a value
///
/// In the inventory the value is what was observed when listing. In saved
/// state it is the value to restore on wake. Serialized as a flat object,
/// e.g. `{"name":"api","kind":"Deployment","namespace":"shop","replicas":3}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Which workload
    #[serde(flatten)]
    pub reference: ResourceRef,
    /// Observed or saved value
    #[serde(flatten)]
    pub value: WorkloadValue,
}

impl ResourceState {
    /// Pair a workload with a value
    pub fn new(reference: ResourceRef, value: WorkloadValue) -> Self {
        Self { reference, value }
    }

    /// Which workload this is
    pub fn identity(&self) -> &ResourceRef {
        &self.reference
    }

    /// Value carried by this state
    pub fn current_value(&self) -> WorkloadValue {
        self.value
    }

    /// Whether the carried value is the sleeping value
    pub fn is_asleep(&self) -> bool {
        self.value == self.reference.kind.sleeping_value()
    }

    /// Put the live workload to sleep
    ///
    /// Returns the value it had before when a write happened, `None` when it
    /// was already asleep and nothing was written.
    pub async fn sleep(&self, client: &dyn WorkloadClient) -> Result<Option<WorkloadValue>, Error> {
        let live = client
            .get_value(&self.reference)
            .await
            .map_err(|e| self.failed(e))?;

        let asleep = self.reference.kind.sleeping_value();
        if live == asleep {
            debug!(workload = %self.reference, "already asleep");
            return Ok(None);
        }

        client
            .set_value(&self.reference, asleep)
            .await
            .map_err(|e| self.failed(e))?;
        debug!(workload = %self.reference, previous = %live, "put to sleep");
        Ok(Some(live))
    }

    /// Restore the carried value on the live workload
    ///
    /// Writes only when the live value differs. A workload that no longer
    /// exists has nothing to restore and counts as woken.
    pub async fn wake(&self, client: &dyn WorkloadClient) -> Result<(), Error> {
        let live = match client.get_value(&self.reference).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                debug!(workload = %self.reference, "workload is gone, nothing to restore");
                return Ok(());
            }
            Err(e) => return Err(self.failed(e)),
        };

        if live == self.value {
            debug!(workload = %self.reference, "already at saved value");
            return Ok(());
        }

        client
            .set_value(&self.reference, self.value)
            .await
            .map_err(|e| self.failed(e))?;
        debug!(workload = %self.reference, restored = %self.value, "woken up");
        Ok(())
    }

    fn failed(&self, err: Error) -> Error {
        match err {
            err @ Error::UpdateFailed { .. } => err,
            err => Error::update_failed(
                self.reference.kind.as_str(),
                &self.reference.name,
                &self.reference.namespace,
                err,
            ),
        }
    }
}

// =============================================================================
// Cluster access
// =============================================================================

/// Trait abstracting reads and writes of workload objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Read the live sleep-relevant value of a workload
    async fn get_value(&self, reference: &ResourceRef) -> Result<WorkloadValue, Error>;

    /// Write a sleep-relevant value to a workload
    async fn set_value(&self, reference: &ResourceRef, value: WorkloadValue) -> Result<(), Error>;
}

/// Real workload client backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a new KubeWorkloadClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, reference: &ResourceRef) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &reference.namespace,
            &reference.kind.api_resource(),
        )
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_value(&self, reference: &ResourceRef) -> Result<WorkloadValue, Error> {
        let obj = self.api(reference).get(&reference.name).await?;
        Ok(reference.kind.read_value(&obj.data))
    }

    async fn set_value(&self, reference: &ResourceRef, value: WorkloadValue) -> Result<(), Error> {
        let patch = reference.kind.patch_for(value)?;
        self.api(reference)
            .patch(
                &reference.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
