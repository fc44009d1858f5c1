//! Orchestrator entry point: HTTP API plus background reconciler

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use urumi_orchestrator::cluster::{ClusterClient, ClusterProbe, KubeClusterClient};
use urumi_orchestrator::config::Settings;
use urumi_orchestrator::coordinator::LifecycleCoordinator;
use urumi_orchestrator::driver::{DeploymentDriver, HelmDriver};
use urumi_orchestrator::{api, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let settings = Arc::new(Settings::parse());
    info!(addr = %settings.listen_addr, "starting orchestrator");

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client));
    let probe = Arc::new(ClusterProbe::new(cluster.clone()));
    let driver: Arc<dyn DeploymentDriver> =
        Arc::new(HelmDriver::new(settings.clone(), probe));

    let coordinator = LifecycleCoordinator::new(settings.clone(), cluster, driver)
        .map_err(|e| anyhow::anyhow!("failed to load store data: {e}"))?;
    coordinator.start_background_sync();

    let app = api::router(coordinator)
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    info!(addr = %settings.listen_addr, "orchestrator listening");
    axum::serve(listener, app).await?;
    Ok(())
}
