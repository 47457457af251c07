//! Workload inventory
//!
//! Resolves `includedObjects` selection rules into concrete kinds, lists the
//! matching workloads and filters them by name pattern.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::Client;
use regex::Regex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::IncludedObject;
use crate::workload::{ResourceRef, ResourceState, WorkloadKind};
use crate::Error;

const WILDCARD: &str = "*";

/// Kinds selected by a rule's `apiVersion` and `kind`
pub fn resolve_kinds(rule: &IncludedObject) -> Result<Vec<WorkloadKind>, Error> {
    let api_version = rule.api_version.trim();
    if api_version != WILDCARD
        && !WorkloadKind::ALL
            .iter()
            .any(|kind| kind.api_version() == api_version)
    {
        return Err(Error::validation(format!(
            "unsupported apiVersion: {}",
            api_version
        )));
    }

    let kind = rule.kind.trim();
    if kind == WILDCARD {
        return Ok(WorkloadKind::ALL
            .into_iter()
            .filter(|k| api_version == WILDCARD || k.api_version() == api_version)
            .collect());
    }

    let kind: WorkloadKind = kind.parse()?;
    if api_version != WILDCARD && kind.api_version() != api_version {
        return Err(Error::validation(format!(
            "kind {} is not served by {}",
            kind, api_version
        )));
    }
    Ok(vec![kind])
}

/// Keep workloads whose name matches `include` and does not match `exclude`
///
/// Both patterns empty keeps everything. Identical non-empty patterns select
/// nothing.
pub fn filter_by_pattern(
    resources: Vec<ResourceState>,
    include: &str,
    exclude: &str,
) -> Result<Vec<ResourceState>, Error> {
    if include.is_empty() && exclude.is_empty() {
        return Ok(resources);
    }
    if include == exclude {
        return Ok(Vec::new());
    }

    let compile = |pattern: &str| {
        Regex::new(pattern)
            .map_err(|e| Error::validation(format!("invalid pattern '{}': {}", pattern, e)))
    };
    let include = compile(include)?;
    let exclude = compile(exclude)?;

    Ok(resources
        .into_iter()
        .filter(|r| include.is_match(&r.reference.name) && !exclude.is_match(&r.reference.name))
        .collect())
}

// =============================================================================
// Snapshot
// =============================================================================

/// Workloads currently selected, grouped by kind
///
/// Only kinds with at least one selected workload are present.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InventorySnapshot {
    by_kind: BTreeMap<WorkloadKind, Vec<ResourceState>>,
}

impl InventorySnapshot {
    /// Add workloads of `kind`, skipping ones already present
    pub fn insert(&mut self, kind: WorkloadKind, resources: Vec<ResourceState>) {
        if resources.is_empty() {
            return;
        }
        let entry = self.by_kind.entry(kind).or_default();
        for resource in resources {
            if !entry
                .iter()
                .any(|existing| existing.reference.same_object(&resource.reference))
            {
                entry.push(resource);
            }
        }
    }

    /// Selected workloads of `kind`
    pub fn get(&self, kind: WorkloadKind) -> &[ResourceState] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kinds with at least one selected workload
    pub fn kinds(&self) -> impl Iterator<Item = WorkloadKind> + '_ {
        self.by_kind.keys().copied()
    }

    /// Total number of selected workloads
    pub fn total(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// Per-kind counts for logging
    pub fn counts(&self) -> BTreeMap<WorkloadKind, usize> {
        self.by_kind
            .iter()
            .map(|(kind, resources)| (*kind, resources.len()))
            .collect()
    }

    /// Whether nothing is selected
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }
}

/// Resolve every rule and collect the selected workloads
pub async fn fetch_included(
    client: &dyn InventoryClient,
    rules: &[IncludedObject],
) -> Result<InventorySnapshot, Error> {
    let mut snapshot = InventorySnapshot::default();

    for rule in rules {
        for kind in resolve_kinds(rule)? {
            let listed = client
                .list(kind, &rule.namespace)
                .await
                .map_err(|e| match e {
                    e @ Error::InventoryFetchFailed { .. } => e,
                    e => Error::inventory(kind.as_str(), &rule.namespace, e),
                })?;
            let selected = filter_by_pattern(listed, &rule.include_ref, &rule.exclude_ref)?;
            debug!(
                kind = %kind,
                namespace = %rule.namespace,
                selected = selected.len(),
                "resolved selection rule"
            );
            snapshot.insert(kind, selected);
        }
    }

    Ok(snapshot)
}

// =============================================================================
// Cluster access
// =============================================================================

/// Trait abstracting workload listing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// List every workload of `kind` in `namespace` ("" for all namespaces)
    async fn list(&self, kind: WorkloadKind, namespace: &str)
        -> Result<Vec<ResourceState>, Error>;
}

/// Real inventory client backed by the Kubernetes API
pub struct KubeInventoryClient {
    client: Client,
}

impl KubeInventoryClient {
    /// Create a new KubeInventoryClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InventoryClient for KubeInventoryClient {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: &str,
    ) -> Result<Vec<ResourceState>, Error> {
        let ar = kind.api_resource();
        let api: Api<DynamicObject> = if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        };

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::inventory(kind.as_str(), namespace, e))?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|obj| {
                let name = obj.metadata.name.clone()?;
                let ns = obj
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| namespace.to_string());
                Some(ResourceState::new(
                    ResourceRef::new(kind, ns, name),
                    kind.read_value(&obj.data),
                ))
            })
            .collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
