//! Access to the Kubernetes objects the controller reads and writes.
//!
//! The reconciler only talks to these traits, so the cluster can be replaced by an in-memory store
//! in tests.

use crate::error::{Error, Result};
use crate::workload::Workload;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    /// Fails with `Error::AlreadyExists` when a secret of that name is already present.
    async fn create_secret(&self, secret: &Secret) -> Result<()>;
    async fn replace_secret(&self, secret: &Secret) -> Result<()>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait WorkloadStore<W: Workload>: Send + Sync {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<W>>;
    /// Replaces the whole object. Fails on a stale resource version.
    async fn replace_workload(&self, workload: &W) -> Result<()>;
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        debug!("Creating secret {}/{}", namespace, secret.name_any());
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        match secrets.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => Err(Error::AlreadyExists {
                kind: "Secret",
                namespace,
                name: secret.name_any(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        debug!("Replacing secret {}/{}", namespace, secret.name_any());
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        secrets
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        debug!("Deleting secret {}/{}", namespace, name);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl<W: Workload> WorkloadStore<W> for KubeStore {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<W>> {
        let api: Api<W> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_workload(&self, workload: &W) -> Result<()> {
        let namespace = workload.namespace().unwrap_or_default();
        debug!(
            "Replacing {} {}/{}",
            W::kind_name(),
            namespace,
            workload.name_any()
        );
        let api: Api<W> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&workload.name_any(), &PostParams::default(), workload)
            .await?;
        Ok(())
    }
}
