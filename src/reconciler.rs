//! Mirrors the images of one workload into the backup registry.
//!
//! A pass fetches the workload, plans a destination for every container image, resolves the pull
//! credentials, ensures the destination pull secret, copies the images that are not mirrored yet
//! and finally replaces the workload with the rewritten images and pull secret. Any failure leaves
//! the workload untouched and schedules another pass after `RETRY_DELAY`; every step is safe to
//! repeat.

use crate::config::BackupTarget;
use crate::credentials;
use crate::destination_secret;
use crate::error::Error;
use crate::event_filter::EventFilter;
use crate::image_reference::{destination_image, is_mirrored, source_registry_host};
use crate::oci_registry::ImageCopier;
use crate::store::{SecretStore, WorkloadStore};
use crate::workload::Workload;
use kube::runtime::controller::Action;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Source and destination image of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMirror {
    pub container: String,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Resolve,
    EnsureSecret,
    Copy,
    Rewrite,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Fetch => "fetch",
            Step::Resolve => "resolve",
            Step::EnsureSecret => "ensure_secret",
            Step::Copy => "copy",
            Step::Rewrite => "rewrite",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub error: Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The workload no longer exists.
    Missing,
    Ignored,
    /// Distinct source images would overwrite each other in the backup registry.
    Conflict(Vec<String>),
    /// Images and pull secrets already point at the backup registry.
    Unchanged,
    Mirrored { copied: usize },
}

/// Destinations for every container of `workload`. Images already served by the backup registry
/// keep their reference.
pub fn plan<W: Workload>(workload: &W, target: &BackupTarget) -> Vec<ImageMirror> {
    workload
        .containers()
        .into_iter()
        .map(|container| {
            let destination = if is_mirrored(&container.image, &target.url) {
                container.image.clone()
            } else {
                destination_image(&container.image, &target.url, &target.username)
            };
            ImageMirror {
                container: container.name,
                source: container.image,
                destination,
            }
        })
        .collect()
}

/// Destinations claimed by more than one distinct source image.
pub fn conflicting_destinations(mirrors: &[ImageMirror]) -> Vec<String> {
    let mut sources: HashMap<&str, &str> = HashMap::new();
    let mut conflicts = Vec::new();
    for mirror in mirrors {
        match sources.insert(&mirror.destination, &mirror.source) {
            Some(previous) if previous != mirror.source => {
                if !conflicts.contains(&mirror.destination) {
                    conflicts.push(mirror.destination.clone());
                }
            }
            _ => {}
        }
    }
    conflicts
}

pub struct Reconciler<S> {
    store: Arc<S>,
    copier: Arc<dyn ImageCopier>,
    target: BackupTarget,
    filter: EventFilter,
}

impl<S> Reconciler<S>
where
    S: SecretStore,
{
    pub fn new(
        store: Arc<S>,
        copier: Arc<dyn ImageCopier>,
        target: BackupTarget,
        filter: EventFilter,
    ) -> Self {
        Self {
            store,
            copier,
            target,
            filter,
        }
    }

    pub fn event_filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Runs one pass for the workload `namespace/name` and tells the controller when to come back.
    pub async fn reconcile<W>(&self, namespace: &str, name: &str) -> Action
    where
        W: Workload,
        S: WorkloadStore<W>,
    {
        let span = info_span!("reconcile", kind = %W::kind_name(), namespace, name);
        match self.mirror::<W>(namespace, name).instrument(span.clone()).await {
            Ok(Outcome::Mirrored { copied }) => {
                span.in_scope(|| info!("Mirrored workload, copied {} images", copied));
                Action::await_change()
            }
            Ok(Outcome::Conflict(destinations)) => {
                span.in_scope(|| {
                    error!(
                        "Refusing to mirror: distinct images map to the same destination {:?}",
                        destinations
                    )
                });
                Action::await_change()
            }
            Ok(outcome) => {
                span.in_scope(|| debug!("Nothing to do: {:?}", outcome));
                Action::await_change()
            }
            Err(failure) => {
                span.in_scope(|| {
                    error!(
                        step = %failure.step,
                        "Reconcile failed, retrying in {}s: {}",
                        RETRY_DELAY.as_secs(),
                        failure.error
                    )
                });
                Action::requeue(RETRY_DELAY)
            }
        }
    }

    async fn mirror<W>(&self, namespace: &str, name: &str) -> Result<Outcome, StepFailure>
    where
        W: Workload,
        S: WorkloadStore<W>,
    {
        let failed = |step: Step| move |error: Error| StepFailure { step, error };

        if self.filter.is_namespace_ignored(namespace) {
            return Ok(Outcome::Ignored);
        }

        let fetched: Option<W> = self
            .store
            .get_workload(namespace, name)
            .await
            .map_err(failed(Step::Fetch))?;
        let Some(mut workload) = fetched else {
            return Ok(Outcome::Missing);
        };

        let mirrors = plan(&workload, &self.target);
        for mirror in &mirrors {
            debug!(
                "Container {} image {} maps to {}",
                mirror.container, mirror.source, mirror.destination
            );
        }
        let conflicts = conflicting_destinations(&mirrors);
        if !conflicts.is_empty() {
            return Ok(Outcome::Conflict(conflicts));
        }

        let source_credentials =
            credentials::resolve(&*self.store, &workload.image_pull_secrets(), namespace)
                .await
                .map_err(failed(Step::Resolve))?;
        debug!("Resolved source credentials {:?}", source_credentials);

        let destination_credentials = self.target.credentials();
        let secret = destination_secret::ensure(&*self.store, &destination_credentials, namespace)
            .await
            .map_err(failed(Step::EnsureSecret))?;

        // Sequential; a failure stops the pass before the workload is rewritten
        let mut copied = 0;
        for mirror in &mirrors {
            if is_mirrored(&mirror.source, &self.target.url) {
                debug!("Image {} is already mirrored", mirror.source);
                continue;
            }
            let host = source_registry_host(&mirror.source);
            let credentials = source_credentials.credentials_for(host);
            if credentials.is_none() {
                debug!("Pulling {} anonymously", mirror.source);
            }
            self.copier
                .copy_image(
                    &mirror.source,
                    &mirror.destination,
                    credentials,
                    &destination_credentials,
                )
                .await
                .map_err(|cause| Error::Copy {
                    source_image: mirror.source.clone(),
                    destination_image: mirror.destination.clone(),
                    cause,
                })
                .map_err(failed(Step::Copy))?;
            copied += 1;
        }

        let secret_name = secret
            .metadata
            .name
            .as_deref()
            .unwrap_or(destination_secret::DESTINATION_SECRET_NAME);
        let original = workload.clone();
        for mirror in &mirrors {
            if !workload.set_container_image(&mirror.container, &mirror.destination) {
                warn!("Container {} disappeared while mirroring", mirror.container);
            }
        }
        workload.set_image_pull_secrets(&[secret_name]);

        if workload.containers() == original.containers()
            && workload.image_pull_secrets() == original.image_pull_secrets()
        {
            return Ok(Outcome::Unchanged);
        }

        self.store
            .replace_workload(&workload)
            .await
            .map_err(failed(Step::Rewrite))?;
        Ok(Outcome::Mirrored { copied })
    }
}
