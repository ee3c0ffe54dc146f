use crate::owner::{WorkloadKind, WorkloadRef};
use crate::store::{StoreError, WorkloadStore};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub static FINGERPRINT_ANNOTATION: &str = "kube-envswitch/fingerprint";
pub static PATCHED_AT_ANNOTATION: &str = "kube-envswitch/patchedAt";

/// The environment overrides to apply, loaded once from configuration and
/// immutable for the controller's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    env: BTreeMap<String, String>,
}

impl PatchSpec {
    pub fn new(env: BTreeMap<String, String>) -> Self {
        PatchSpec { env }
    }

    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
    }

    /// Content hash of the spec. Stored on patched workloads so repeated
    /// crash-loop events for an already-patched workload become no-ops, while
    /// a reconfigured spec patches again.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.env {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// One merge patch was submitted.
    Patched,
    /// The workload already carries this spec's fingerprint (or the spec is
    /// empty); zero writes issued.
    NoOp,
}

/// Applies the configured env overrides to resolved workloads, exactly once
/// per (workload, spec fingerprint).
pub struct PatchCoordinator {
    spec: PatchSpec,
    fingerprint: String,
    // Serializes the read-compare-write sequence per workload so concurrent
    // events for the same workload cannot both observe "not yet patched".
    locks: Mutex<HashMap<WorkloadRef, Arc<Mutex<()>>>>,
}

impl PatchCoordinator {
    pub fn new(spec: PatchSpec) -> Self {
        let fingerprint = spec.fingerprint();
        PatchCoordinator {
            spec,
            fingerprint,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the workload, compares fingerprints and submits a single merge
    /// patch when needed. A conflict is retried once against a fresh read;
    /// the retry re-runs the fingerprint comparison, so losing a concurrent
    /// race resolves to `NoOp`.
    pub async fn apply<S: WorkloadStore>(
        &self,
        store: &S,
        workload: &WorkloadRef,
    ) -> Result<PatchOutcome, StoreError> {
        if self.spec.is_empty() {
            debug!("Empty env patch configured, nothing to apply");
            return Ok(PatchOutcome::NoOp);
        }

        let lock = self.lock_for(workload).await;
        let _guard = lock.lock().await;

        match self.try_apply(store, workload).await {
            Err(StoreError::Conflict) => {
                debug!("Conflict patching {}, retrying once with a fresh read", workload);
                self.try_apply(store, workload).await
            }
            outcome => outcome,
        }
    }

    async fn try_apply<S: WorkloadStore>(
        &self,
        store: &S,
        workload: &WorkloadRef,
    ) -> Result<PatchOutcome, StoreError> {
        let state = store.get_workload(workload).await?;
        if state.annotations.get(FINGERPRINT_ANNOTATION) == Some(&self.fingerprint) {
            debug!("{} already patched with this spec", workload);
            return Ok(PatchOutcome::NoOp);
        }

        let containers: Vec<Container> = state
            .containers
            .into_iter()
            .map(|mut container| {
                container.env = Some(merge_env(container.env.take(), &self.spec));
                container
            })
            .collect();
        let patch = build_patch(
            workload.kind,
            &containers,
            &self.fingerprint,
            state.resource_version.as_deref(),
        );

        debug!("Patching {} with {}", workload, patch);
        store.patch_workload(workload, &patch).await?;
        Ok(PatchOutcome::Patched)
    }

    async fn lock_for(&self, workload: &WorkloadRef) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workload.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Upserts the spec's entries into an env list by variable name: replaces the
/// value where the name exists, appends where it does not, and leaves every
/// other entry untouched. A plain value replaces any `valueFrom` source on a
/// named entry.
fn merge_env(existing: Option<Vec<EnvVar>>, spec: &PatchSpec) -> Vec<EnvVar> {
    let mut merged = existing.unwrap_or_default();
    for (name, value) in &spec.env {
        match merged.iter_mut().find(|entry| entry.name == *name) {
            Some(entry) => {
                entry.value = Some(value.clone());
                entry.value_from = None;
            }
            None => merged.push(EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                value_from: None,
            }),
        }
    }
    merged
}

/// One merge-patch document carrying both the patch-record annotations and
/// the rewritten pod-template containers. Including the resourceVersion read
/// earlier turns a concurrent modification into a 409 instead of a lost
/// update.
fn build_patch(
    kind: WorkloadKind,
    containers: &[Container],
    fingerprint: &str,
    resource_version: Option<&str>,
) -> serde_json::Value {
    let template = json!({ "spec": { "containers": containers } });
    let spec = match kind {
        WorkloadKind::CronJob => json!({ "jobTemplate": { "spec": { "template": template } } }),
        _ => json!({ "template": template }),
    };
    let mut metadata = json!({
        "annotations": {
            FINGERPRINT_ANNOTATION: fingerprint,
            PATCHED_AT_ANNOTATION: Utc::now().to_rfc3339(),
        }
    });
    if let Some(resource_version) = resource_version {
        metadata["resourceVersion"] = json!(resource_version);
    }
    json!({ "metadata": metadata, "spec": spec })
}
