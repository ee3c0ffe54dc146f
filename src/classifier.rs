use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use std::cmp;

/// Health verdict derived from a single pod snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashLoopVerdict {
    Healthy,
    CrashLooping { restarts: i32 },
    /// Status data is absent or incomplete; the pipeline treats this as a
    /// no-op, not an error.
    Indeterminate,
}

/// Classifies a pod as crash-looping when any container reports the configured
/// failure reason with at least `min_restarts` restarts (inclusive).
///
/// Pure function over the pod snapshot: the same input always yields the same
/// verdict.
pub fn classify(pod: &Pod, reason: &str, min_restarts: i32) -> CrashLoopVerdict {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());
    let Some(statuses) = statuses else {
        return CrashLoopVerdict::Indeterminate;
    };
    if statuses.is_empty() {
        return CrashLoopVerdict::Indeterminate;
    }

    let mut max_restarts: Option<i32> = None;
    let mut incomplete = false;
    for status in statuses {
        if status.state.is_none() {
            // Container has not reported any state yet.
            incomplete = true;
            continue;
        }
        if let Some(observed) = failure_reason(status)
            && observed == reason
            && status.restart_count >= min_restarts
        {
            max_restarts = Some(cmp::max(
                max_restarts.unwrap_or(status.restart_count),
                status.restart_count,
            ));
        }
    }

    match max_restarts {
        Some(restarts) => CrashLoopVerdict::CrashLooping { restarts },
        None if incomplete => CrashLoopVerdict::Indeterminate,
        None => CrashLoopVerdict::Healthy,
    }
}

/// The reason a container is currently failing for: the waiting-state reason
/// (where the kubelet reports `CrashLoopBackOff`), falling back to the last
/// terminated reason.
fn failure_reason(status: &ContainerStatus) -> Option<&str> {
    if let Some(reason) = status
        .state
        .as_ref()
        .and_then(|state| state.waiting.as_ref())
        .and_then(|waiting| waiting.reason.as_deref())
    {
        return Some(reason);
    }
    status
        .last_state
        .as_ref()
        .and_then(|state| state.terminated.as_ref())
        .and_then(|terminated| terminated.reason.as_deref())
}
