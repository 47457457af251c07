//! Saved-state store
//!
//! Records which workloads Kronos put to sleep and the value each one had
//! before, so they can be restored exactly. One Secret per KronosApp holds a
//! JSON array per workload kind, keyed by the kind name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::workload::{ResourceState, WorkloadKind};
use crate::Error;

/// Label marking Secrets created by Kronos
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Name of the saved-state Secret for a KronosApp
pub fn secret_name(app: &str) -> String {
    format!("kronosapp-{}", app)
}

/// Trait abstracting access to the backing Secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Read the Secret's data, `None` when the Secret does not exist
    async fn get(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;

    /// Create an empty Secret; succeeds if it already exists
    async fn create(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Replace a single data key
    async fn write_key(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error>;

    /// Drop all data keys, keeping the Secret
    async fn clear(&self, name: &str, namespace: &str) -> Result<(), Error>;
}

/// Real Secret client backed by the Kubernetes API
pub struct KubeSecretClient {
    client: Client,
}

impl KubeSecretClient {
    /// Create a new KubeSecretClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn get(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        match self.api(namespace).get(name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(key, ByteString(value))| (key, value))
                    .collect(),
            )),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    "kronos".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        match self.api(namespace).create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(secret = %name, "secret already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_key(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let patch = json!({ "data": { key: ByteString(value) } });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn clear(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let patch = json!({ "data": null });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Saved state of one KronosApp, loaded from its Secret
///
/// Reads are served from the snapshot taken by `open`; writes go straight
/// to the Secret and update the snapshot.
pub struct SavedStateStore {
    client: Arc<dyn SecretClient>,
    name: String,
    namespace: String,
    data: BTreeMap<String, Vec<u8>>,
}

impl SavedStateStore {
    /// Open the store of `app` in `namespace`, `None` when the Secret is missing
    pub async fn open(
        client: Arc<dyn SecretClient>,
        app: &str,
        namespace: &str,
    ) -> Result<Option<Self>, Error> {
        let name = secret_name(app);
        let Some(data) = client.get(&name, namespace).await? else {
            return Ok(None);
        };
        Ok(Some(Self {
            client,
            name,
            namespace: namespace.to_string(),
            data,
        }))
    }

    /// Backing Secret name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a non-empty list is saved for `kind`
    pub fn has_data(&self, kind: WorkloadKind) -> bool {
        self.data
            .get(kind.as_str())
            .is_some_and(|raw| !is_empty_list(raw))
    }

    /// Kinds with a non-empty saved list
    pub fn kinds_with_data(&self) -> Vec<WorkloadKind> {
        for key in self.data.keys() {
            if key.parse::<WorkloadKind>().is_err() {
                warn!(secret = %self.name, key = %key, "ignoring unknown key in saved state");
            }
        }
        WorkloadKind::ALL
            .into_iter()
            .filter(|kind| self.has_data(*kind))
            .collect()
    }

    /// Whether nothing is saved for any kind
    pub fn is_empty(&self) -> bool {
        WorkloadKind::ALL.iter().all(|kind| !self.has_data(*kind))
    }

    /// Saved workloads of `kind`, empty when nothing is saved
    pub fn load(&self, kind: WorkloadKind) -> Result<Vec<ResourceState>, Error> {
        let Some(raw) = self.data.get(kind.as_str()) else {
            return Ok(Vec::new());
        };
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let corrupt = |message: String| Error::CorruptState {
            kind: kind.to_string(),
            message,
        };
        let states: Vec<ResourceState> =
            serde_json::from_slice(raw).map_err(|e| corrupt(e.to_string()))?;

        for state in &states {
            if state.reference.kind != kind || !kind.accepts(&state.value) {
                return Err(corrupt(format!(
                    "entry {} does not belong under {}",
                    state.reference, kind
                )));
            }
        }
        Ok(states)
    }

    /// Replace the saved list of `kind`
    pub async fn save(&mut self, kind: WorkloadKind, states: &[ResourceState]) -> Result<(), Error> {
        let raw = serde_json::to_vec(states).map_err(|e| Error::serialization(e.to_string()))?;
        self.client
            .write_key(&self.name, &self.namespace, kind.as_str(), raw.clone())
            .await?;
        debug!(secret = %self.name, kind = %kind, entries = states.len(), "saved state");
        self.data.insert(kind.as_str().to_string(), raw);
        Ok(())
    }

    /// Drop everything saved for every kind
    pub async fn purge(&mut self) -> Result<(), Error> {
        self.client.clear(&self.name, &self.namespace).await?;
        debug!(secret = %self.name, "purged saved state");
        self.data.clear();
        Ok(())
    }
}

fn is_empty_list(raw: &[u8]) -> bool {
    let trimmed: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    trimmed.is_empty() || trimmed == b"[]" || trimmed == b"null"
}

// =============================================================================
// Tests
// =============================================================================
