use crate::error::Error;
use crate::event_filter::{Notification, NotificationTracker};
use crate::reconciler::{RETRY_DELAY, Reconciler};
use crate::store::KubeStore;
use crate::workload::Workload;
use futures::channel::mpsc;
use futures::{StreamExt, TryStreamExt, future, stream};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Watches every `W` in the cluster and mirrors it whenever it is created or its spec changes.
///
/// Each message on `resync` re-runs the reconciler for every cached object. Returns once a
/// termination signal has been received and the in-flight passes have finished.
pub async fn run<W: Workload>(
    api: Api<W>,
    reconciler: Arc<Reconciler<KubeStore>>,
    resync: mpsc::Receiver<()>,
) {
    let kind_name = W::kind_name();
    let kind: &str = &kind_name;
    info!("Starting {} controller", kind);

    let (reader, writer) = reflector::store::<W>();
    let filter = reconciler.event_filter().clone();
    let mut tracker = NotificationTracker::<W>::default();

    let notifications = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .map_ok(move |event| {
            stream::iter(
                tracker
                    .observe(event)
                    .into_iter()
                    .map(Ok::<_, watcher::Error>),
            )
        })
        .try_flatten()
        .try_filter(move |notification| future::ready(filter.is_relevant(notification)))
        .map_ok(Notification::into_object);

    Controller::for_stream(notifications, reader)
        .reconcile_all_on(resync)
        .shutdown_on_signal()
        .run(reconcile::<W>, error_policy::<W>, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object),
                Err(e) if is_deleted_object(&e) => debug!("Nothing to reconcile: {}", e),
                Err(e) => warn!("{} controller error: {}", kind, e),
            }
        })
        .await;

    info!("{} controller stopped", kind);
}

/// A confirmed delete reaches the controller after the reflector dropped the object, so the
/// runtime reports it as missing instead of calling the reconciler.
fn is_deleted_object<Q>(error: &controller::Error<Error, Q>) -> bool {
    matches!(error, controller::Error::ObjectNotFound(_))
}

async fn reconcile<W: Workload>(
    workload: Arc<W>,
    reconciler: Arc<Reconciler<KubeStore>>,
) -> Result<Action, Error> {
    let namespace = workload.namespace().unwrap_or_default();
    Ok(reconciler
        .reconcile::<W>(&namespace, &workload.name_any())
        .await)
}

fn error_policy<W: Workload>(
    workload: Arc<W>,
    error: &Error,
    _reconciler: Arc<Reconciler<KubeStore>>,
) -> Action {
    warn!(
        "Reconcile of {} {} failed: {}",
        W::kind_name(),
        workload.name_any(),
        error
    );
    Action::requeue(RETRY_DELAY)
}
