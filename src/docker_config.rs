//! Codec for the `.dockerconfigjson` document:
//! `{"auths": {"<host>": {"username": "<u>", "password": "<p>"}}}`.
//!
//! Decoding accepts the combined base64 `auth` field, encoding never emits it so the encoded bytes
//! only depend on host, username and password.

use crate::credentials::{RegistryCredentialSet, RegistryCredentials, registry_host};
use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct DockerConfigDocument {
    #[serde(default)]
    auths: Option<BTreeMap<String, AuthEntry>>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Serialize)]
struct EncodedDocument<'a> {
    auths: BTreeMap<&'a str, EncodedEntry<'a>>,
}

#[derive(Serialize)]
struct EncodedEntry<'a> {
    username: &'a str,
    password: &'a str,
}

pub fn decode(bytes: &[u8]) -> Result<RegistryCredentialSet> {
    let document: DockerConfigDocument =
        serde_json::from_slice(bytes).map_err(|e| Error::Format(e.to_string()))?;

    Ok(document
        .auths
        .unwrap_or_default()
        .into_iter()
        .map(|(key, entry)| {
            let (username, password) = entry.into_login(&key);
            RegistryCredentials::new(registry_host(&key), username, password)
        })
        .collect())
}

pub fn encode(host: &str, username: &str, password: &str) -> Result<Vec<u8>> {
    let document = EncodedDocument {
        auths: BTreeMap::from([(host, EncodedEntry { username, password })]),
    };
    serde_json::to_vec(&document).map_err(Error::Encoding)
}

impl AuthEntry {
    fn into_login(self, key: &str) -> (String, String) {
        let username = self.username.unwrap_or_default();
        let password = self.password.unwrap_or_default();
        if !username.is_empty() || !password.is_empty() {
            return (username, password);
        }

        match self.auth.as_deref().map(decode_basic_auth) {
            Some(Some(login)) => login,
            Some(None) => {
                warn!("Ignoring undecodable auth field for registry {}", key);
                (username, password)
            }
            None => (username, password),
        }
    }
}

fn decode_basic_auth(auth: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(auth.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
