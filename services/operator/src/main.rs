//! Operator entry point.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wake_operator::consul::ConsulClient;
use wake_operator::machine::new_machine;
use wake_operator::runtime::DockerRuntime;
use wake_operator::{status, AgentController, AgentState, BootManifest, Config, MachineActor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(manifest = %config.manifest_path.display(), "Starting wake operator");

    let machine = MachineActor::spawn(new_machine()?);

    let manifest = match load_manifest(&config) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "Configuration failed");
            machine
                .transition(AgentState::ConfigFailed, Some(Arc::new(e)))
                .await?;
            std::process::exit(1);
        }
    };
    info!(
        node = %manifest.node_name,
        consul = %manifest.directory_host,
        services = manifest.services.len(),
        should_loop = manifest.should_loop,
        "Configuration loaded"
    );

    let runtime = Arc::new(DockerRuntime::new(config.self_name.clone()));
    let registry = Arc::new(ConsulClient::new(manifest.directory_host.clone())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(config.status_addr).await?;
    info!(addr = %config.status_addr, "Status endpoint listening");
    let status_handle = tokio::spawn(status::serve(listener, machine.clone(), shutdown_rx.clone()));

    let controller = AgentController::new(manifest, runtime, registry, machine);
    let mut control_handle = tokio::spawn(async move { controller.run(shutdown_rx).await });

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            control_handle.await
        }
        result = &mut control_handle => result,
    };
    let _ = shutdown_tx.send(true);

    match status_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Status server error"),
        Err(e) => error!(error = %e, "Status server task panicked"),
    }

    match result {
        Ok(Ok(())) => {
            info!("Operator stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, reason = e.reason_code(), "State machine failure");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Control loop panicked");
            Err(e.into())
        }
    }
}

fn load_manifest(config: &Config) -> Result<BootManifest, wake_operator::error::ConfigError> {
    let mut manifest = BootManifest::load(&config.manifest_path)?;
    manifest.apply_overrides(config)?;
    Ok(manifest)
}
