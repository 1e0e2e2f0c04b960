use std::{path::Path, sync::Arc};

use {
    anyhow::Result,
    deskfarm_config::DeskfarmConfig,
    deskfarm_fleet::{
        CloudflaredTunnelProvider, Collaborators, ContainerRuntime, DockerRuntime,
        LifecycleController, SysinfoHostMetrics,
    },
    tracing::info,
};

use crate::config_commands;

/// Wire the controller to the production collaborators.
pub fn build_controller(config: &DeskfarmConfig) -> Result<Arc<LifecycleController>> {
    let collaborators = Collaborators {
        runtime: Arc::new(DockerRuntime::from_config(&config.runtime)),
        tunnels: Arc::new(CloudflaredTunnelProvider::from_config(&config.tunnel)),
        metrics: Arc::new(SysinfoHostMetrics),
    };
    let tunnel_provider = collaborators.tunnels.provider_name();
    let controller = LifecycleController::new(config, collaborators)?;
    info!(
        backend = controller.runtime_backend(),
        tunnels = tunnel_provider,
        image = %config.runtime.image,
        "lifecycle controller ready"
    );
    Ok(Arc::new(controller))
}

/// Print every managed container the runtime reports, one JSON object per line.
pub async fn list(path: Option<&Path>) -> Result<()> {
    let config = config_commands::load(path)?;
    let runtime = DockerRuntime::from_config(&config.runtime);
    let handles = runtime.list().await?;
    if handles.is_empty() {
        eprintln!("No managed containers.");
    }
    for handle in &handles {
        println!("{}", serde_json::to_string(handle)?);
    }
    Ok(())
}

/// Adopt running containers, reclaim the expired ones and report.
pub async fn reclaim(path: Option<&Path>, ttl_hours: Option<u64>) -> Result<()> {
    let mut config = config_commands::load(path)?;
    if let Some(hours) = ttl_hours {
        config.lifecycle.ttl_hours = hours;
    }
    let controller = build_controller(&config)?;
    controller.adopt_existing().await?;

    let report = controller.reclaim_now().await;
    for id in &report.removed {
        println!("removed {id}");
    }
    for failure in &report.failures {
        eprintln!("failed {}: {}", failure.id, failure.reason);
    }
    eprintln!(
        "{} removed, {} failed",
        report.count(),
        report.failures.len()
    );
    if !report.failures.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
