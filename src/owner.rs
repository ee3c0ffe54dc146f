use crate::store::{StoreError, WorkloadStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::HashSet;
use std::fmt;

/// Upper bound on owner-chain hops. Real chains are two levels deep
/// (Pod -> ReplicaSet -> Deployment); anything longer is malformed metadata.
pub const MAX_OWNER_HOPS: usize = 8;

/// Resource kinds the resolver understands. All but `ReplicaSet` carry a pod
/// template and terminate the walk; a `ReplicaSet` is climbed through to its
/// own controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    Job,
    CronJob,
}

impl WorkloadKind {
    /// Maps an owner reference's apiVersion/kind pair. Returns `None` for
    /// kinds outside the supported set, including custom resources.
    pub fn from_owner(api_version: &str, kind: &str) -> Option<Self> {
        let (group, _version) = api_version.split_once('/')?;
        match (group, kind) {
            ("apps", "Deployment") => Some(WorkloadKind::Deployment),
            ("apps", "StatefulSet") => Some(WorkloadKind::StatefulSet),
            ("apps", "DaemonSet") => Some(WorkloadKind::DaemonSet),
            ("apps", "ReplicaSet") => Some(WorkloadKind::ReplicaSet),
            ("batch", "Job") => Some(WorkloadKind::Job),
            ("batch", "CronJob") => Some(WorkloadKind::CronJob),
            _ => None,
        }
    }

    pub fn is_patchable(self) -> bool {
        !matches!(self, WorkloadKind::ReplicaSet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resolved top-level workload, usable as the read/patch handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} in {}", self.kind, self.name, self.namespace)
    }
}

/// Owner reference as carried on resource metadata, reduced to the fields the
/// resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

impl From<&OwnerReference> for OwnerRef {
    fn from(reference: &OwnerReference) -> Self {
        OwnerRef {
            api_version: reference.api_version.clone(),
            kind: reference.kind.clone(),
            name: reference.name.clone(),
            controller: reference.controller.unwrap_or(false),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
    /// No owner reference with the controller flag set at some hop.
    NoController,
    /// A resource along the chain no longer exists.
    OwnerNotFound(WorkloadRef),
    /// Hop bound exceeded or a cycle detected in the owner metadata.
    ChainTooLong,
    /// The controller owner is a kind this controller cannot patch through.
    UnsupportedKind(String),
    /// Store access failed for a reason other than a missing resource.
    Store(StoreError),
}

impl std::error::Error for ResolveError {}
impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::NoController => write!(f, "no controller owner reference"),
            ResolveError::OwnerNotFound(workload) => {
                write!(f, "owner {} not found", workload)
            }
            ResolveError::ChainTooLong => {
                write!(f, "owner chain exceeds {} hops or cycles", MAX_OWNER_HOPS)
            }
            ResolveError::UnsupportedKind(kind) => {
                write!(f, "unsupported owner kind {}", kind)
            }
            ResolveError::Store(err) => write!(f, "owner lookup failed: {}", err),
        }
    }
}

/// Walks the controller-owner chain from a pod's owner references up to the
/// first patchable workload kind.
///
/// Read-only: resolving the same chain repeatedly yields identical results and
/// never mutates cluster state.
pub async fn resolve<S: WorkloadStore>(
    namespace: &str,
    owner_refs: &[OwnerRef],
    store: &S,
) -> Result<WorkloadRef, ResolveError> {
    let mut refs = owner_refs.to_vec();
    let mut seen: HashSet<(WorkloadKind, String)> = HashSet::new();

    for _ in 0..MAX_OWNER_HOPS {
        let controller = refs
            .iter()
            .find(|reference| reference.controller)
            .ok_or(ResolveError::NoController)?;
        let kind = WorkloadKind::from_owner(&controller.api_version, &controller.kind)
            .ok_or_else(|| ResolveError::UnsupportedKind(controller.kind.clone()))?;
        if !seen.insert((kind, controller.name.clone())) {
            return Err(ResolveError::ChainTooLong);
        }

        let target = WorkloadRef {
            kind,
            namespace: namespace.to_string(),
            name: controller.name.clone(),
        };
        if kind.is_patchable() {
            return Ok(target);
        }

        refs = match store.owner_references(kind, namespace, &target.name).await {
            Ok(refs) => refs,
            Err(StoreError::NotFound) => return Err(ResolveError::OwnerNotFound(target)),
            Err(err) => return Err(ResolveError::Store(err)),
        };
    }

    Err(ResolveError::ChainTooLong)
}
