use crate::owner::{OwnerRef, WorkloadKind, WorkloadRef};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Container;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;

static FIELD_MANAGER: &str = "kube-envswitch";

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The resource does not exist (or disappeared mid-flight).
    NotFound,
    /// Optimistic-concurrency collision: the resource changed between the
    /// read and the patch.
    Conflict,
    /// Any other API failure.
    Api(String),
}

impl std::error::Error for StoreError {}
impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "resource not found"),
            StoreError::Conflict => write!(f, "resource changed since it was read"),
            StoreError::Api(message) => write!(f, "api error: {}", message),
        }
    }
}

/// Snapshot of the parts of a workload the patch coordinator reads: the
/// annotations carrying the patch record, the pod-template containers, and the
/// resourceVersion for optimistic concurrency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadState {
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    pub resource_version: Option<String>,
}

/// Boundary to the cluster's resource store. The resolver only reads owner
/// metadata; the patch coordinator reads workload state and submits merge
/// patches.
pub trait WorkloadStore {
    fn owner_references(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Vec<OwnerRef>, StoreError>> + Send;

    fn get_workload(
        &self,
        workload: &WorkloadRef,
    ) -> impl Future<Output = Result<WorkloadState, StoreError>> + Send;

    fn patch_workload(
        &self,
        workload: &WorkloadRef,
        patch: &serde_json::Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Workload kinds whose pod template this controller can read and patch.
trait PatchTarget:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Send
    + Sync
    + DeserializeOwned
    + 'static
{
    fn template_containers(&self) -> Option<&Vec<Container>>;
}

impl PatchTarget for Deployment {
    fn template_containers(&self) -> Option<&Vec<Container>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|pod_spec| &pod_spec.containers)
    }
}

impl PatchTarget for StatefulSet {
    fn template_containers(&self) -> Option<&Vec<Container>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|pod_spec| &pod_spec.containers)
    }
}

impl PatchTarget for DaemonSet {
    fn template_containers(&self) -> Option<&Vec<Container>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|pod_spec| &pod_spec.containers)
    }
}

impl PatchTarget for Job {
    fn template_containers(&self) -> Option<&Vec<Container>> {
        self.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|pod_spec| &pod_spec.containers)
    }
}

impl PatchTarget for CronJob {
    fn template_containers(&self) -> Option<&Vec<Container>> {
        self.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .and_then(|job_spec| job_spec.template.spec.as_ref())
            .map(|pod_spec| &pod_spec.containers)
    }
}

/// Store backed by the Kubernetes API server, one typed `Api` per supported
/// kind.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    async fn fetch_owner_refs<K>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<OwnerRef>, StoreError>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let metadata = api.get_metadata(name).await.map_err(map_kube_error)?;
        Ok(metadata
            .metadata
            .owner_references
            .unwrap_or_default()
            .iter()
            .map(OwnerRef::from)
            .collect())
    }

    async fn fetch_state<K: PatchTarget>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadState, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let workload = api.get(name).await.map_err(map_kube_error)?;
        Ok(WorkloadState {
            annotations: workload.annotations().clone(),
            containers: workload.template_containers().cloned().unwrap_or_default(),
            resource_version: workload.meta().resource_version.clone(),
        })
    }

    async fn submit_patch<K: PatchTarget>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }
}

impl WorkloadStore for KubeStore {
    async fn owner_references(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<OwnerRef>, StoreError> {
        match kind {
            WorkloadKind::Deployment => self.fetch_owner_refs::<Deployment>(namespace, name).await,
            WorkloadKind::StatefulSet => {
                self.fetch_owner_refs::<StatefulSet>(namespace, name).await
            }
            WorkloadKind::DaemonSet => self.fetch_owner_refs::<DaemonSet>(namespace, name).await,
            WorkloadKind::ReplicaSet => self.fetch_owner_refs::<ReplicaSet>(namespace, name).await,
            WorkloadKind::Job => self.fetch_owner_refs::<Job>(namespace, name).await,
            WorkloadKind::CronJob => self.fetch_owner_refs::<CronJob>(namespace, name).await,
        }
    }

    async fn get_workload(&self, workload: &WorkloadRef) -> Result<WorkloadState, StoreError> {
        let (namespace, name) = (workload.namespace.as_str(), workload.name.as_str());
        match workload.kind {
            WorkloadKind::Deployment => self.fetch_state::<Deployment>(namespace, name).await,
            WorkloadKind::StatefulSet => self.fetch_state::<StatefulSet>(namespace, name).await,
            WorkloadKind::DaemonSet => self.fetch_state::<DaemonSet>(namespace, name).await,
            WorkloadKind::Job => self.fetch_state::<Job>(namespace, name).await,
            WorkloadKind::CronJob => self.fetch_state::<CronJob>(namespace, name).await,
            WorkloadKind::ReplicaSet => Err(StoreError::Api(format!(
                "{} has no patchable pod template",
                workload.kind
            ))),
        }
    }

    async fn patch_workload(
        &self,
        workload: &WorkloadRef,
        patch: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let (namespace, name) = (workload.namespace.as_str(), workload.name.as_str());
        match workload.kind {
            WorkloadKind::Deployment => self.submit_patch::<Deployment>(namespace, name, patch).await,
            WorkloadKind::StatefulSet => {
                self.submit_patch::<StatefulSet>(namespace, name, patch).await
            }
            WorkloadKind::DaemonSet => self.submit_patch::<DaemonSet>(namespace, name, patch).await,
            WorkloadKind::Job => self.submit_patch::<Job>(namespace, name, patch).await,
            WorkloadKind::CronJob => self.submit_patch::<CronJob>(namespace, name, patch).await,
            WorkloadKind::ReplicaSet => Err(StoreError::Api(format!(
                "{} has no patchable pod template",
                workload.kind
            ))),
        }
    }
}

fn map_kube_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound,
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict,
        other => StoreError::Api(other.to_string()),
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store: owner metadata for resolver tests, workload state and
    /// recorded patches for coordinator tests. Patches are applied back to the
    /// stored state with merge semantics so subsequent reads observe them.
    #[derive(Default)]
    pub struct FakeStore {
        owners: HashMap<(WorkloadKind, String), Vec<OwnerRef>>,
        workloads: Mutex<HashMap<WorkloadRef, WorkloadState>>,
        patches: Mutex<Vec<(WorkloadRef, Value)>>,
        conflicts_remaining: Mutex<u32>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_owners(
            mut self,
            kind: WorkloadKind,
            name: &str,
            refs: Vec<OwnerRef>,
        ) -> Self {
            self.owners.insert((kind, name.to_string()), refs);
            self
        }

        pub fn with_workload(self, workload: WorkloadRef, state: WorkloadState) -> Self {
            self.workloads.lock().unwrap().insert(workload, state);
            self
        }

        /// Rejects the next `count` patch calls with `Conflict`.
        pub fn with_conflicts(self, count: u32) -> Self {
            *self.conflicts_remaining.lock().unwrap() = count;
            self
        }

        pub fn patch_count(&self) -> usize {
            self.patches.lock().unwrap().len()
        }

        pub fn recorded_patches(&self) -> Vec<Value> {
            self.patches
                .lock()
                .unwrap()
                .iter()
                .map(|(_, patch)| patch.clone())
                .collect()
        }

        pub fn workload_state(&self, workload: &WorkloadRef) -> WorkloadState {
            self.workloads
                .lock()
                .unwrap()
                .get(workload)
                .cloned()
                .expect("workload present")
        }

        pub fn put_workload(&self, workload: WorkloadRef, state: WorkloadState) {
            self.workloads.lock().unwrap().insert(workload, state);
        }

        fn merge_into_state(state: &mut WorkloadState, patch: &Value) {
            if let Some(annotations) = patch
                .pointer("/metadata/annotations")
                .and_then(Value::as_object)
            {
                for (key, value) in annotations {
                    if let Some(value) = value.as_str() {
                        state.annotations.insert(key.clone(), value.to_string());
                    }
                }
            }
            let containers = patch
                .pointer("/spec/template/spec/containers")
                .or_else(|| patch.pointer("/spec/jobTemplate/spec/template/spec/containers"));
            if let Some(containers) = containers {
                state.containers =
                    serde_json::from_value(containers.clone()).expect("containers in patch");
            }
        }
    }

    impl WorkloadStore for FakeStore {
        async fn owner_references(
            &self,
            kind: WorkloadKind,
            _namespace: &str,
            name: &str,
        ) -> Result<Vec<OwnerRef>, StoreError> {
            self.owners
                .get(&(kind, name.to_string()))
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn get_workload(&self, workload: &WorkloadRef) -> Result<WorkloadState, StoreError> {
            self.workloads
                .lock()
                .unwrap()
                .get(workload)
                .cloned()
                .ok_or(StoreError::NotFound)
        }

        async fn patch_workload(
            &self,
            workload: &WorkloadRef,
            patch: &Value,
        ) -> Result<(), StoreError> {
            {
                let mut conflicts = self.conflicts_remaining.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    return Err(StoreError::Conflict);
                }
            }
            let mut workloads = self.workloads.lock().unwrap();
            let state = workloads.get_mut(workload).ok_or(StoreError::NotFound)?;
            Self::merge_into_state(state, patch);
            self.patches
                .lock()
                .unwrap()
                .push((workload.clone(), patch.clone()));
            Ok(())
        }
    }
}
