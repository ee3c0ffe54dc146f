use crate::classifier::{CrashLoopVerdict, classify};
use crate::owner::{OwnerRef, WorkloadRef, resolve};
use crate::patcher::{PatchCoordinator, PatchOutcome};
use crate::selector::LabelSelector;
use crate::store::{StoreError, WorkloadStore};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Per-event result handed back to the watch substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Patched(WorkloadRef),
    NoOp,
    Failed { reason: String },
}

/// One pod event flows admission filter -> classifier -> resolver ->
/// coordinator. Every failure class ends up in the event's `Outcome`; nothing
/// here escalates past the event.
pub struct Pipeline<S> {
    selector: LabelSelector,
    crash_loop_reason: String,
    min_restarts: i32,
    coordinator: PatchCoordinator,
    store: S,
}

impl<S: WorkloadStore> Pipeline<S> {
    pub fn new(
        selector: LabelSelector,
        crash_loop_reason: String,
        min_restarts: i32,
        coordinator: PatchCoordinator,
        store: S,
    ) -> Self {
        Pipeline {
            selector,
            crash_loop_reason,
            min_restarts,
            coordinator,
            store,
        }
    }

    /// Selector string for server-side filtering on the pod watch. The
    /// in-process admission check still runs per event; watch caches can
    /// deliver pods from before a label change.
    pub fn watch_labels(&self) -> String {
        self.selector.to_query()
    }

    pub async fn handle(&self, pod: &Pod) -> Outcome {
        let pod_name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());

        if !self.selector.matches(pod.labels()) {
            debug!("Pod {} does not match selector {}", pod_name, self.selector);
            return Outcome::NoOp;
        }

        let restarts = match classify(pod, &self.crash_loop_reason, self.min_restarts) {
            CrashLoopVerdict::Healthy => {
                debug!("Pod {} is healthy", pod_name);
                return Outcome::NoOp;
            }
            CrashLoopVerdict::Indeterminate => {
                debug!("Pod {} has incomplete status data, skipping", pod_name);
                return Outcome::NoOp;
            }
            CrashLoopVerdict::CrashLooping { restarts } => restarts,
        };
        info!(
            "Crash-loop detected on pod {} in {} after {} restarts",
            pod_name, namespace, restarts
        );

        let owner_refs: Vec<OwnerRef> = pod
            .owner_references()
            .iter()
            .map(OwnerRef::from)
            .collect();
        let workload = match resolve(&namespace, &owner_refs, &self.store).await {
            Ok(workload) => workload,
            Err(err) => {
                warn!("Could not resolve owner of pod {}: {}", pod_name, err);
                return Outcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        match self.coordinator.apply(&self.store, &workload).await {
            Ok(PatchOutcome::Patched) => {
                info!("Patched env of {} for pod {}", workload, pod_name);
                Outcome::Patched(workload)
            }
            Ok(PatchOutcome::NoOp) => {
                debug!("{} already carries the configured env patch", workload);
                Outcome::NoOp
            }
            Err(StoreError::NotFound) => {
                // The workload disappeared mid-flight; there is nothing left
                // to patch, so the event counts as handled.
                warn!("{} no longer exists, skipping patch", workload);
                Outcome::Failed {
                    reason: format!("workload {} not found", workload),
                }
            }
            Err(err) => {
                warn!("Failed to patch {}: {}", workload, err);
                Outcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::WorkloadKind;
    use crate::patcher::{FINGERPRINT_ANNOTATION, PatchSpec};
    use crate::store::WorkloadState;
    use crate::store::test_support::FakeStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn crashloop_pod(labels: serde_json::Value, owners: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": "web-7d9f-abcde",
                "namespace": "default",
                "labels": labels,
                "ownerReferences": owners
            },
            "status": {
                "containerStatuses": [{
                    "name": "app",
                    "image": "registry.example.com/app:1.0",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 1,
                    "state": { "waiting": { "reason": "CrashLoopBackOff" } }
                }]
            }
        }))
        .expect("valid pod")
    }

    fn replicaset_owner() -> serde_json::Value {
        json!([{
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "name": "web-7d9f",
            "uid": "1",
            "controller": true
        }])
    }

    fn deployment_ref() -> WorkloadRef {
        WorkloadRef {
            kind: WorkloadKind::Deployment,
            namespace: "default".to_string(),
            name: "web".to_string(),
        }
    }

    fn store_with_chain() -> FakeStore {
        let containers = serde_json::from_value(json!([{ "name": "app", "env": [] }])).unwrap();
        FakeStore::new()
            .with_owners(
                WorkloadKind::ReplicaSet,
                "web-7d9f",
                vec![crate::owner::OwnerRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                    controller: true,
                }],
            )
            .with_workload(
                deployment_ref(),
                WorkloadState {
                    annotations: BTreeMap::new(),
                    containers,
                    resource_version: Some("7".to_string()),
                },
            )
    }

    fn pipeline(store: FakeStore) -> Pipeline<FakeStore> {
        Pipeline::new(
            LabelSelector::parse("envswitch=true").unwrap(),
            "CrashLoopBackOff".to_string(),
            1,
            PatchCoordinator::new(PatchSpec::new(BTreeMap::from([(
                "FIX_ME".to_string(),
                "1".to_string(),
            )]))),
            store,
        )
    }

    #[tokio::test]
    async fn test_crashloop_pod_patches_owning_deployment() {
        let pipeline = pipeline(store_with_chain());
        let pod = crashloop_pod(json!({ "envswitch": "true" }), replicaset_owner());

        let outcome = pipeline.handle(&pod).await;

        assert_eq!(outcome, Outcome::Patched(deployment_ref()));
        assert_eq!(pipeline.store.patch_count(), 1);
        let env = pipeline.store.workload_state(&deployment_ref()).containers[0]
            .env
            .clone()
            .unwrap();
        assert!(
            env.iter()
                .any(|e| e.name == "FIX_ME" && e.value.as_deref() == Some("1"))
        );
    }

    #[tokio::test]
    async fn test_already_patched_deployment_is_a_no_op() {
        let store = store_with_chain();
        let fingerprint = PatchSpec::new(BTreeMap::from([(
            "FIX_ME".to_string(),
            "1".to_string(),
        )]))
        .fingerprint();
        let mut state = store.workload_state(&deployment_ref());
        state
            .annotations
            .insert(FINGERPRINT_ANNOTATION.to_string(), fingerprint);
        store.put_workload(deployment_ref(), state);
        let pipeline = pipeline(store);
        let pod = crashloop_pod(json!({ "envswitch": "true" }), replicaset_owner());

        let outcome = pipeline.handle(&pod).await;

        assert_eq!(outcome, Outcome::NoOp);
        assert_eq!(pipeline.store.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_labels_are_rejected() {
        let pipeline = pipeline(store_with_chain());
        let pod = crashloop_pod(json!({ "app": "web" }), replicaset_owner());

        assert_eq!(pipeline.handle(&pod).await, Outcome::NoOp);
        assert_eq!(pipeline.store.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_healthy_pod_is_a_no_op() {
        let pipeline = pipeline(store_with_chain());
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": "web-7d9f-abcde",
                "namespace": "default",
                "labels": { "envswitch": "true" },
                "ownerReferences": replicaset_owner()
            },
            "status": {
                "containerStatuses": [{
                    "name": "app",
                    "image": "registry.example.com/app:1.0",
                    "imageID": "",
                    "ready": true,
                    "restartCount": 0,
                    "state": { "running": { "startedAt": "2024-01-01T00:00:00Z" } }
                }]
            }
        }))
        .unwrap();

        assert_eq!(pipeline.handle(&pod).await, Outcome::NoOp);
        assert_eq!(pipeline.store.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_pod_without_controller_owner_fails_without_write() {
        let pipeline = pipeline(store_with_chain());
        let pod = crashloop_pod(json!({ "envswitch": "true" }), json!([]));

        let outcome = pipeline.handle(&pod).await;

        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "no controller owner reference".to_string()
            }
        );
        assert_eq!(pipeline.store.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_vanished_workload_reports_failed() {
        let store = FakeStore::new().with_owners(
            WorkloadKind::ReplicaSet,
            "web-7d9f",
            vec![crate::owner::OwnerRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                controller: true,
            }],
        );
        let pipeline = pipeline(store);
        let pod = crashloop_pod(json!({ "envswitch": "true" }), replicaset_owner());

        let outcome = pipeline.handle(&pod).await;

        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "workload Deployment/web in default not found".to_string()
            }
        );
        assert_eq!(pipeline.store.patch_count(), 0);
    }
}
