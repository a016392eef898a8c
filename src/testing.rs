//! In-memory doubles for the object store and the image copier.

use crate::credentials::RegistryCredentials;
use crate::destination_secret::{DOCKER_CONFIG_JSON_KEY, DOCKER_CONFIG_JSON_TYPE};
use crate::error::{Error, Result};
use crate::oci_registry::ImageCopier;
use crate::store::{SecretStore, WorkloadStore};
use crate::workload::Workload;
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodSpec, PodTemplateSpec, Secret};
use kube::ResourceExt;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Key = (String, String);

#[derive(Default)]
pub struct InMemoryStore {
    secrets: Mutex<BTreeMap<Key, Secret>>,
    workloads: Mutex<BTreeMap<(String, String, String), serde_json::Value>>,
    concurrent_secret: Mutex<Option<Secret>>,
    secret_writes: AtomicUsize,
    workload_replacements: AtomicUsize,
    fail_secret_writes: AtomicBool,
    fail_workload_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn insert_secret(&self, secret: Secret) {
        let key = (secret.namespace().unwrap_or_default(), secret.name_any());
        self.secrets.lock().unwrap().insert(key, secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Makes the next create find `secret` already written by another writer.
    pub fn create_secret_concurrently(&self, secret: Secret) {
        *self.concurrent_secret.lock().unwrap() = Some(secret);
    }

    pub fn insert_workload<W: Workload>(&self, workload: &W) {
        let key = (
            W::kind_name().into_owned(),
            workload.namespace().unwrap_or_default(),
            workload.name_any(),
        );
        let value = serde_json::to_value(workload).unwrap();
        self.workloads.lock().unwrap().insert(key, value);
    }

    pub fn workload<W: Workload>(&self, namespace: &str, name: &str) -> Option<W> {
        self.workloads
            .lock()
            .unwrap()
            .get(&(
                W::kind_name().into_owned(),
                namespace.to_string(),
                name.to_string(),
            ))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn secret_writes(&self) -> usize {
        self.secret_writes.load(Ordering::SeqCst)
    }

    pub fn workload_replacements(&self) -> usize {
        self.workload_replacements.load(Ordering::SeqCst)
    }

    pub fn fail_secret_writes(&self) {
        self.fail_secret_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_workload_writes(&self, fail: bool) {
        self.fail_workload_writes.store(fail, Ordering::SeqCst);
    }

    fn write_secret(&self, secret: &Secret) -> Result<()> {
        if self.fail_secret_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("secret writes are disabled".into()));
        }
        self.secret_writes.fetch_add(1, Ordering::SeqCst);
        self.insert_secret(secret.clone());
        Ok(())
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        if let Some(winner) = self.concurrent_secret.lock().unwrap().take() {
            self.insert_secret(winner);
        }
        let namespace = secret.namespace().unwrap_or_default();
        if self.secret(&namespace, &secret.name_any()).is_some() {
            return Err(Error::AlreadyExists {
                kind: "Secret",
                namespace,
                name: secret.name_any(),
            });
        }
        self.write_secret(secret)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        if self.secret(&namespace, &secret.name_any()).is_none() {
            return Err(Error::Store("secret does not exist".into()));
        }
        self.write_secret(secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound {
                kind: "Secret",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

#[async_trait]
impl<W: Workload> WorkloadStore<W> for InMemoryStore {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<W>> {
        Ok(self.workload(namespace, name))
    }

    async fn replace_workload(&self, workload: &W) -> Result<()> {
        if self.fail_workload_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("workload writes are disabled".into()));
        }
        self.workload_replacements.fetch_add(1, Ordering::SeqCst);
        self.insert_workload(workload);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyCall {
    pub source: String,
    pub destination: String,
    pub source_credentials: Option<RegistryCredentials>,
    pub destination_credentials: RegistryCredentials,
}

/// Records every copy request; fails those whose source is listed in `failing`.
#[derive(Default)]
pub struct RecordingCopier {
    calls: Mutex<Vec<CopyCall>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingCopier {
    pub fn fail_on(&self, source: &str) {
        self.failing.lock().unwrap().push(source.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<CopyCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageCopier for RecordingCopier {
    async fn copy_image(
        &self,
        source: &str,
        destination: &str,
        source_credentials: Option<&RegistryCredentials>,
        destination_credentials: &RegistryCredentials,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(CopyCall {
            source: source.to_string(),
            destination: destination.to_string(),
            source_credentials: source_credentials.cloned(),
            destination_credentials: destination_credentials.clone(),
        });
        if self.failing.lock().unwrap().iter().any(|s| s == source) {
            anyhow::bail!("registry rejected the credentials for {}", source);
        }
        Ok(())
    }
}

fn metadata(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        generation: Some(1),
        ..Default::default()
    }
}

fn pod_template(images: &[&str], pull_secrets: &[&str]) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: images
                .iter()
                .enumerate()
                .map(|(i, image)| Container {
                    name: format!("container-{}", i),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            image_pull_secrets: (!pull_secrets.is_empty()).then(|| {
                pull_secrets
                    .iter()
                    .map(|name| LocalObjectReference {
                        name: name.to_string(),
                    })
                    .collect()
            }),
            ..Default::default()
        }),
    }
}

pub fn deployment(namespace: &str, name: &str, images: &[&str], pull_secrets: &[&str]) -> Deployment {
    Deployment {
        metadata: metadata(namespace, name),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            template: pod_template(images, pull_secrets),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn daemon_set(namespace: &str, name: &str, images: &[&str], pull_secrets: &[&str]) -> DaemonSet {
    DaemonSet {
        metadata: metadata(namespace, name),
        spec: Some(DaemonSetSpec {
            template: pod_template(images, pull_secrets),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn docker_config_secret(namespace: &str, name: &str, document: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(document.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

pub fn opaque_secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            "token".to_string(),
            ByteString(b"not-a-docker-config".to_vec()),
        )])),
        ..Default::default()
    }
}
