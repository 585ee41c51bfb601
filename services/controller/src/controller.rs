//! Controller wiring.
//!
//! Owns the fleet state, catalog and node pools, and runs every component
//! as its own task: event ingestion, catalog refresh, provisioning,
//! consolidation and termination. All tasks share one stop signal.

use std::sync::Arc;
use std::time::Duration;

use flotilla_events::{ChangeEvent, ObjectKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::catalog::CapacityCatalog;
use crate::cloudprovider::CloudProvider;
use crate::config::{BatcherConfig, Config};
use crate::disruption::{Consolidator, PodEvictor, Terminator};
use crate::error::ControllerError;
use crate::nodepool::NodePoolRegistry;
use crate::provisioning::{batcher, BatchTrigger, Launcher, Provisioner};
use crate::state::{Cluster, NodeObject, PodObject};

/// How long each task gets to stop after shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Change-event streams the controller consumes.
#[derive(Debug)]
pub struct EventStreams {
    pub nodes: mpsc::Receiver<ChangeEvent<NodeObject>>,
    pub pods: mpsc::Receiver<ChangeEvent<PodObject>>,
}

/// The node-lifecycle controller.
pub struct Controller {
    cluster: Arc<Cluster>,
    catalog: Arc<CapacityCatalog>,
    pools: Arc<NodePoolRegistry>,
    provisioner: Arc<Provisioner>,
    consolidator: Arc<Consolidator>,
    terminator: Arc<Terminator>,
    batcher: BatcherConfig,
}

impl Controller {
    pub fn new(
        config: &Config,
        provider: Arc<dyn CloudProvider>,
        evictor: Arc<dyn PodEvictor>,
        pools: Arc<NodePoolRegistry>,
    ) -> Self {
        let cluster = Arc::new(Cluster::new());
        let catalog = Arc::new(CapacityCatalog::new(provider.clone(), config.catalog()));

        let provisioning = config.provisioner();
        let launcher = Arc::new(Launcher::new(
            provider.clone(),
            cluster.clone(),
            catalog.clone(),
            provisioning.launch_max_attempts,
            provisioning.launch_backoff.clone(),
        ));

        let provisioner = Arc::new(Provisioner::new(
            cluster.clone(),
            catalog.clone(),
            pools.clone(),
            launcher.clone(),
            provisioning,
        ));
        let consolidator = Arc::new(Consolidator::new(
            cluster.clone(),
            catalog.clone(),
            pools.clone(),
            launcher,
            config.consolidation(),
        ));
        let terminator = Arc::new(Terminator::new(
            cluster.clone(),
            provider,
            evictor,
            config.termination(),
        ));

        Self {
            cluster,
            catalog,
            pools,
            provisioner,
            consolidator,
            terminator,
            batcher: config.batcher(),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn catalog(&self) -> &Arc<CapacityCatalog> {
        &self.catalog
    }

    pub fn pools(&self) -> &Arc<NodePoolRegistry> {
        &self.pools
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn consolidator(&self) -> &Arc<Consolidator> {
        &self.consolidator
    }

    pub fn terminator(&self) -> &Arc<Terminator> {
        &self.terminator
    }

    /// Run until `shutdown` flips to true or a task fails.
    ///
    /// A change-event stream that ends before shutdown is fatal: the fleet
    /// state could no longer be trusted.
    pub async fn run(
        &self,
        streams: EventStreams,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        info!("Starting controller");

        match self.catalog.refresh().await {
            Ok(generation) => info!(generation, "Initial catalog loaded"),
            Err(e) => warn!(error = %e, "Initial catalog refresh failed, retrying on interval"),
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (trigger, batcher) = batcher(self.batcher);
        let mut tasks: JoinSet<Result<(), ControllerError>> = JoinSet::new();

        tasks.spawn(ingest_nodes(self.cluster.clone(), streams.nodes, stop_rx.clone()));
        tasks.spawn(ingest_pods(
            self.cluster.clone(),
            streams.pods,
            trigger,
            stop_rx.clone(),
        ));

        let catalog = self.catalog.clone();
        let stop = stop_rx.clone();
        tasks.spawn(async move {
            catalog.run(stop).await;
            Ok(())
        });

        let provisioner = self.provisioner.clone();
        let stop = stop_rx.clone();
        tasks.spawn(async move {
            provisioner.run(batcher, stop).await;
            Ok(())
        });

        let consolidator = self.consolidator.clone();
        let stop = stop_rx.clone();
        tasks.spawn(async move {
            consolidator.run(stop).await;
            Ok(())
        });

        let terminator = self.terminator.clone();
        let stop = stop_rx;
        tasks.spawn(async move {
            terminator.run(stop).await;
            Ok(())
        });

        let outcome = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Received shutdown signal");
                        break Ok(());
                    }
                }
                Some(joined) = tasks.join_next() => {
                    let err = match joined {
                        Ok(Ok(())) => ControllerError::Task("task exited before shutdown".to_string()),
                        Ok(Err(e)) => e,
                        Err(e) => ControllerError::Task(e.to_string()),
                    };
                    error!(error = %err, "Controller task failed");
                    break Err(err);
                }
            }
        };

        let _ = stop_tx.send(true);

        info!("Waiting for tasks to shut down...");
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Task ended abnormally during shutdown");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Tasks did not shut down in time, aborting");
            tasks.abort_all();
        }

        info!("Controller stopped");
        outcome
    }
}

async fn ingest_nodes(
    cluster: Arc<Cluster>,
    mut events: mpsc::Receiver<ChangeEvent<NodeObject>>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let outcome = cluster.apply_node_event(&event);
                    debug!(node_id = %event.payload.id, change = %event.change, ?outcome, "Node event");
                }
                None => return closed(ObjectKind::Node, &stop),
            },
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn ingest_pods(
    cluster: Arc<Cluster>,
    mut events: mpsc::Receiver<ChangeEvent<PodObject>>,
    trigger: BatchTrigger,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    let outcome = cluster.apply_pod_event(&event);
                    debug!(pod_id = %event.payload.id, change = %event.change, ?outcome, "Pod event");

                    let pod = &event.payload;
                    if event.change.is_upsert() && pod.unschedulable && pod.node.is_none() {
                        trigger.trigger();
                    }
                }
                None => return closed(ObjectKind::Pod, &stop),
            },
            _ = stop.changed() => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

fn closed(kind: ObjectKind, stop: &watch::Receiver<bool>) -> Result<(), ControllerError> {
    if *stop.borrow() {
        Ok(())
    } else {
        Err(ControllerError::EventStreamClosed(kind))
    }
}
