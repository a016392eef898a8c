//! The pull secret that lets a mirrored workload authenticate against the backup registry.

use crate::credentials::RegistryCredentials;
use crate::docker_config;
use crate::error::{Error, Result};
use crate::store::SecretStore;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub static DESTINATION_SECRET_NAME: &str = "destination-registry-creds";
pub static DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
static MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
static MANAGED_BY_VALUE: &str = "kube-image-backup";

/// Builds the destination secret holding exactly one registry's credentials.
pub fn build(target: &RegistryCredentials, namespace: &str) -> Result<Secret> {
    let payload = docker_config::encode(target.url(), target.username(), target.password())?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(DESTINATION_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(payload),
        )])),
        ..Default::default()
    })
}

/// Creates the destination secret in `namespace`, or overwrites the payload of the existing one.
///
/// An existing secret that already carries the expected type and payload is left untouched, so
/// repeated calls with the same credentials write nothing. A secret of another type is recreated,
/// since the type of a secret cannot be changed in place.
pub async fn ensure<S>(store: &S, target: &RegistryCredentials, namespace: &str) -> Result<Secret>
where
    S: SecretStore + ?Sized,
{
    let desired = build(target, namespace)?;

    let existing = match store.get_secret(namespace, DESTINATION_SECRET_NAME).await? {
        Some(existing) => existing,
        None => {
            info!(
                "Creating destination secret {}/{} for registry {}",
                namespace,
                DESTINATION_SECRET_NAME,
                target.url()
            );
            match store.create_secret(&desired).await {
                Ok(()) => return Ok(desired),
                // Another controller created it between the read and the write
                Err(Error::AlreadyExists { .. }) => store
                    .get_secret(namespace, DESTINATION_SECRET_NAME)
                    .await?
                    .ok_or_else(|| Error::NotFound {
                        kind: "Secret",
                        namespace: namespace.to_string(),
                        name: DESTINATION_SECRET_NAME.to_string(),
                    })?,
                Err(e) => return Err(e),
            }
        }
    };

    update(store, existing, desired).await
}

async fn update<S>(store: &S, mut existing: Secret, desired: Secret) -> Result<Secret>
where
    S: SecretStore + ?Sized,
{
    let namespace = desired.metadata.namespace.as_deref().unwrap_or_default();

    if existing.type_ != desired.type_ {
        info!(
            "Recreating destination secret {}/{} with type {} (was {})",
            namespace,
            DESTINATION_SECRET_NAME,
            DOCKER_CONFIG_JSON_TYPE,
            existing.type_.as_deref().unwrap_or("Opaque")
        );
        store.delete_secret(namespace, DESTINATION_SECRET_NAME).await?;
        store.create_secret(&desired).await?;
        return Ok(desired);
    }

    if existing.data == desired.data {
        debug!(
            "Destination secret {}/{} is up to date",
            namespace, DESTINATION_SECRET_NAME
        );
        return Ok(existing);
    }

    info!(
        "Overwriting destination secret {}/{}",
        namespace, DESTINATION_SECRET_NAME
    );
    existing.data = desired.data;
    store.replace_secret(&existing).await?;
    Ok(existing)
}
