//! Registry credentials and their resolution from the pull secrets a workload references.

use crate::destination_secret::{DOCKER_CONFIG_JSON_KEY, DOCKER_CONFIG_JSON_TYPE};
use crate::docker_config;
use crate::error::{Error, Result};
use crate::secret_string::SecretString;
use crate::store::SecretStore;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Registry consulted when an image's leading path segment matches no resolved credential.
pub static DEFAULT_REGISTRY_HOST: &str = "index.docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    url: String,
    username: String,
    password: SecretString,
}

impl RegistryCredentials {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<SecretString>,
    ) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Anonymous entries carry neither a username nor a password.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password().is_empty()
    }
}

/// Credentials keyed by registry host, built fresh for every reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentialSet {
    by_host: BTreeMap<String, RegistryCredentials>,
}

impl RegistryCredentialSet {
    /// Inserts or replaces the entry for the credential's host, returning the replaced entry.
    pub fn insert(&mut self, credentials: RegistryCredentials) -> Option<RegistryCredentials> {
        self.by_host.insert(credentials.url.clone(), credentials)
    }

    pub fn get(&self, host: &str) -> Option<&RegistryCredentials> {
        self.by_host.get(host)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryCredentials> {
        self.by_host.values()
    }

    /// Credentials to pull from `host`: the exact entry, else the default public registry's entry,
    /// else anonymous access.
    pub fn credentials_for(&self, host: &str) -> Option<&RegistryCredentials> {
        self.get(host).or_else(|| self.get(DEFAULT_REGISTRY_HOST))
    }
}

impl FromIterator<RegistryCredentials> for RegistryCredentialSet {
    fn from_iter<I: IntoIterator<Item = RegistryCredentials>>(iter: I) -> Self {
        let mut set = RegistryCredentialSet::default();
        for credentials in iter {
            set.insert(credentials);
        }
        set
    }
}

/// Strips an `http://` or `https://` prefix and trailing slashes.
pub fn trim_registry_url(url: &str) -> &str {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    url.trim_end_matches('/')
}

/// Reduces a docker config key such as `https://index.docker.io/v1/` to its host.
pub fn registry_host(key: &str) -> &str {
    let trimmed = trim_registry_url(key);
    trimmed.split('/').next().unwrap_or(trimmed)
}

/// Builds the credential set for `pull_secrets` in `namespace`.
///
/// Secrets are read in reference order and a later secret naming an already seen host replaces the
/// earlier entry. Secrets that are not of the docker config JSON type are skipped; a referenced
/// secret that does not exist fails the whole resolution.
pub async fn resolve<S>(
    store: &S,
    pull_secrets: &[String],
    namespace: &str,
) -> Result<RegistryCredentialSet>
where
    S: SecretStore + ?Sized,
{
    let mut resolved = RegistryCredentialSet::default();

    for name in pull_secrets {
        let secret = store
            .get_secret(namespace, name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "Secret",
                namespace: namespace.to_string(),
                name: name.clone(),
            })?;

        if secret.type_.as_deref() != Some(DOCKER_CONFIG_JSON_TYPE) {
            debug!(
                "Ignoring pull secret {}/{} of type {:?}",
                namespace, name, secret.type_
            );
            continue;
        }

        let payload = secret
            .data
            .as_ref()
            .and_then(|data| data.get(DOCKER_CONFIG_JSON_KEY))
            .ok_or_else(|| {
                Error::Format(format!(
                    "secret {}/{} has no {} entry",
                    namespace, name, DOCKER_CONFIG_JSON_KEY
                ))
            })?;

        let decoded = docker_config::decode(&payload.0).map_err(|e| match e {
            Error::Format(reason) => {
                Error::Format(format!("secret {}/{}: {}", namespace, name, reason))
            }
            other => other,
        })?;

        for credentials in decoded.iter().cloned() {
            if let Some(previous) = resolved.insert(credentials) {
                warn!(
                    "Pull secret {}/{} overrides credentials for registry {}",
                    namespace,
                    name,
                    previous.url()
                );
            }
        }
    }

    Ok(resolved)
}
