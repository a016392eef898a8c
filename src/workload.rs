use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodSpec};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::fmt::Debug;

/// Image of one container in a workload's pod template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub name: String,
    pub image: String,
}

/// A pod-template-bearing object whose container images can be mirrored.
///
/// Init containers are listed before regular containers; both lists share one name space, so
/// containers are addressed by name.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Default
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> Cow<'static, str> {
        Self::kind(&())
    }
    fn pod_spec(&self) -> Option<&PodSpec>;
    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec>;

    fn containers(&self) -> Vec<ContainerImage> {
        self.pod_spec()
            .map(|ps| {
                ps.init_containers
                    .iter()
                    .flatten()
                    .chain(ps.containers.iter())
                    .map(|c| ContainerImage {
                        name: c.name.clone(),
                        image: c.image.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sets the image of the named container. Returns false when no such container exists.
    fn set_container_image(&mut self, container: &str, image: &str) -> bool {
        let Some(ps) = self.pod_spec_mut() else {
            return false;
        };
        let found: Option<&mut Container> = ps
            .init_containers
            .iter_mut()
            .flatten()
            .chain(ps.containers.iter_mut())
            .find(|c| c.name == container);
        match found {
            Some(c) => {
                c.image = Some(image.to_string());
                true
            }
            None => false,
        }
    }

    fn image_pull_secrets(&self) -> Vec<String> {
        self.pod_spec()
            .and_then(|ps| ps.image_pull_secrets.as_ref())
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    fn set_image_pull_secrets(&mut self, names: &[&str]) {
        if let Some(ps) = self.pod_spec_mut() {
            ps.image_pull_secrets = Some(
                names
                    .iter()
                    .map(|name| LocalObjectReference {
                        name: name.to_string(),
                    })
                    .collect(),
            );
        }
    }
}

impl Workload for Deployment {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}

impl Workload for DaemonSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        self.spec.as_mut().and_then(|s| s.template.spec.as_mut())
    }
}
