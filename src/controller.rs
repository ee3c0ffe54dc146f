use crate::pipeline::{Outcome, Pipeline};
use crate::store::WorkloadStore;
use futures::{TryStreamExt, pin_mut};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Watches pods matching the configured selector across all namespaces and
/// runs the pipeline per applied event. The watcher redelivers on transient
/// failure with backoff, so a `Failed` outcome for a still-crash-looping pod
/// is retried naturally on its next status change.
pub async fn run<S: WorkloadStore + Sync>(
    client: Client,
    pipeline: Pipeline<S>,
) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::all(client);
    let watch_config = watcher::Config::default().labels(&pipeline.watch_labels());
    info!(
        "Watching pods with label selector {}",
        pipeline.watch_labels()
    );

    let events = watcher(pods, watch_config)
        .default_backoff()
        .applied_objects();
    pin_mut!(events);

    while let Some(pod) = events.try_next().await? {
        let pod_name = pod.name_any();
        match pipeline.handle(&pod).await {
            Outcome::Patched(workload) => {
                info!("Event for pod {} patched {}", pod_name, workload)
            }
            Outcome::NoOp => debug!("Event for pod {} required no action", pod_name),
            Outcome::Failed { reason } => {
                warn!("Event for pod {} failed: {}", pod_name, reason)
            }
        }
    }

    Ok(())
}
