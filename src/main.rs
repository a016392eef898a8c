use crate::config::load_config;
use crate::error::Error;
use crate::event_filter::EventFilter;
use crate::oci_registry::RegistryImageCopier;
use crate::reconciler::Reconciler;
use crate::state::ControllerState;
use crate::store::KubeStore;
use futures::channel::mpsc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::Api;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod credentials;
mod destination_secret;
mod docker_config;
mod error;
mod event_filter;
mod image_reference;
mod oci_registry;
mod reconciler;
mod secret_string;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod webserver;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting kube-image-backup {}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        "Mirroring images into {} as {}, ignoring namespaces {:?}",
        config.backup_registry.url, config.backup_registry.username, config.ignore_namespaces
    );

    let filter = EventFilter::new(&config.ignore_namespaces)
        .map_err(|e| Error::Config(format!("invalid namespace pattern: {}", e)))?;
    let client = controller::create_client().await?;
    let copier = RegistryImageCopier::new(
        oci_registry::create_client()?,
        config.insecure_registries.clone(),
    );
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(copier),
        config.backup_registry.clone(),
        filter,
    ));

    let (deployment_resync, deployment_resync_rx) = mpsc::channel::<()>(1);
    let (daemon_set_resync, daemon_set_resync_rx) = mpsc::channel::<()>(1);

    info!("Executing resync at cron schedule {}", config.resync_schedule);
    let mut scheduler = JobScheduler::new().await?;
    let job = Job::new_async(config.resync_schedule.clone(), move |_uuid, _l| {
        let mut senders = [deployment_resync.clone(), daemon_set_resync.clone()];
        Box::pin(async move {
            info!("Resyncing all workloads");
            for sender in senders.iter_mut() {
                // A full channel already holds a pending resync
                if let Err(e) = sender.try_send(()) {
                    debug!("Skipping resync: {}", e);
                }
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let state = Arc::new(ControllerState::default());
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(webserver::serve(
        config.webserver.port,
        state.clone(),
        shutdown.clone(),
    ));

    state.set_ready(true);
    tokio::join!(
        controller::run(
            Api::<Deployment>::all(client.clone()),
            reconciler.clone(),
            deployment_resync_rx,
        ),
        controller::run(
            Api::<DaemonSet>::all(client),
            reconciler,
            daemon_set_resync_rx,
        ),
    );
    state.set_ready(false);

    info!("Shutting down");
    shutdown.cancel();
    scheduler.shutdown().await?;
    match server.await {
        Ok(Err(e)) => error!("Webserver failed: {:?}", e),
        Err(e) => error!("Webserver task failed: {:?}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}
