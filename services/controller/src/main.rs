//! Flotilla controller
//!
//! Runs the node-lifecycle controller against the in-process fake cloud
//! provider. Node events come from the provider and pod events from the
//! fake evictor, so the binary exercises the whole loop without a real
//! cluster.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use flotilla_controller::{
    catalog::{CapacityType, Offering},
    cloudprovider::FakeCloudProvider,
    config::Config,
    disruption::FakeEvictor,
    nodepool::{NodePool, NodePoolRegistry},
    resources::Resources,
    Controller, EventStreams,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVENT_BUFFER: usize = 1024;

fn sample_offerings() -> Vec<Offering> {
    let shapes = [("m.large", 4, 16, 0.20), ("m.xlarge", 8, 32, 0.35), ("m.2xlarge", 16, 64, 0.68)];
    let mut offerings = Vec::new();

    for zone in ["zone-a", "zone-b"] {
        for (shape, cores, gib, price) in shapes {
            let capacity = Resources::cores_gib(cores, gib).with_pods(110);
            for (capacity_type, factor) in [(CapacityType::OnDemand, 1.0), (CapacityType::Spot, 0.4)] {
                offerings.push(Offering {
                    shape: shape.to_string(),
                    capacity,
                    allocatable: capacity,
                    zone: zone.to_string(),
                    capacity_type,
                    price: price * factor,
                    observed_at: Utc::now(),
                });
            }
        }
    }

    offerings
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLOTILLA_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting flotilla controller");
    info!(
        ordering = %config.proposal_ordering,
        batch_idle_ms = config.batch_idle.as_millis() as u64,
        consolidation_interval_secs = config.consolidation_interval.as_secs(),
        "Configuration loaded"
    );

    let (node_tx, node_rx) = mpsc::channel(EVENT_BUFFER);
    let (pod_tx, pod_rx) = mpsc::channel(EVENT_BUFFER);

    let provider = Arc::new(FakeCloudProvider::new(sample_offerings()).with_node_events(node_tx));
    let evictor = Arc::new(FakeEvictor::new().with_pod_events(pod_tx, true));
    let pools = Arc::new(
        NodePoolRegistry::new(vec![NodePool::new("default")]).context("invalid node pools")?,
    );

    let controller = Controller::new(&config, provider, evictor, pools);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let streams = EventStreams {
        nodes: node_rx,
        pods: pod_rx,
    };
    let mut controller_handle =
        tokio::spawn(async move { controller.run(streams, shutdown_rx).await });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            return match result {
                Ok(Ok(())) => {
                    info!("Controller exited normally");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Controller failed");
                    Err(e.into())
                }
                Err(e) => {
                    error!(error = %e, "Controller task panicked");
                    Err(e.into())
                }
            };
        }
    }

    // Signal shutdown to the controller
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(15);
    match tokio::time::timeout(shutdown_timeout, controller_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Controller stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "Controller task panicked during shutdown"),
        Err(e) => warn!(error = %e, "Controller did not shut down in time"),
        Ok(Ok(Ok(()))) => {}
    }

    info!("Controller shutdown complete");
    Ok(())
}
