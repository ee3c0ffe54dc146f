use crate::patcher::{PatchCoordinator, PatchSpec};
use crate::pipeline::Pipeline;
use crate::selector::LabelSelector;
use crate::store::KubeStore;
use anyhow::Context;
use std::env;
use tracing::info;

mod classifier;
mod config;
mod controller;
mod owner;
mod patcher;
mod pipeline;
mod selector;
mod store;
mod webserver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-envswitch {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yaml".to_string());
    let config = config::load_config(&config_path)?;
    let selector = LabelSelector::parse(&config.label_selector)
        .with_context(|| format!("Invalid label selector: {}", config.label_selector))?;
    if config.env_patch.is_empty() {
        info!("No env patch configured; crash-loop events will be observed but not patched");
    }

    info!("Initializing K8s controller");
    let client = controller::create_client().await?;
    let pipeline = Pipeline::new(
        selector,
        config.crash_loop_reason.clone(),
        config.min_restarts,
        PatchCoordinator::new(PatchSpec::new(config.env_patch.clone())),
        KubeStore::new(client.clone()),
    );

    tokio::spawn(async move {
        if let Err(e) = controller::run(client, pipeline).await {
            tracing::error!("Pod watcher terminated: {:?}", e);
            std::process::exit(1);
        }
    });

    let app = webserver::create_app();
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
