use crate::credentials::RegistryCredentials;
use crate::image_reference::{ImageReference, TagOrDigest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info};

static DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
static MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    DOCKER_MANIFEST_V2,
];

/// Transfers an image between registries.
#[async_trait]
pub trait ImageCopier: Send + Sync {
    /// Copies `source` to `destination`. `source_credentials` of `None` pulls anonymously.
    async fn copy_image(
        &self,
        source: &str,
        destination: &str,
        source_credentials: Option<&RegistryCredentials>,
        destination_credentials: &RegistryCredentials,
    ) -> Result<()>;
}

/// Copies images over the registry HTTP API.
pub struct RegistryImageCopier {
    client: Client,
    insecure_registries: Vec<String>,
}

pub fn create_client() -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    Client::builder()
        .user_agent(concat!("kube-image-backup/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

impl RegistryImageCopier {
    pub fn new(client: Client, insecure_registries: Vec<String>) -> Self {
        Self {
            client,
            insecure_registries,
        }
    }

    fn session<'a>(
        &'a self,
        image: &ImageReference,
        credentials: Option<&'a RegistryCredentials>,
        actions: &'static str,
    ) -> RegistrySession<'a> {
        let host = image.api_host();
        let scheme = if self.insecure_registries.iter().any(|r| r == host) {
            "http"
        } else {
            "https"
        };
        RegistrySession {
            client: &self.client,
            base_url: format!("{}://{}", scheme, host),
            repository: image.repository.clone(),
            credentials: credentials.filter(|c| !c.is_anonymous()),
            actions,
            token: None,
        }
    }
}

#[async_trait]
impl ImageCopier for RegistryImageCopier {
    async fn copy_image(
        &self,
        source: &str,
        destination: &str,
        source_credentials: Option<&RegistryCredentials>,
        destination_credentials: &RegistryCredentials,
    ) -> Result<()> {
        let source_ref = ImageReference::parse(source)
            .with_context(|| format!("Invalid source image {}", source))?;
        let destination_ref = ImageReference::parse(destination)
            .with_context(|| format!("Invalid destination image {}", destination))?;

        info!("Copying image {} to {}", source_ref, destination_ref);
        let mut from = self.session(&source_ref, source_credentials, "pull");
        let mut to = self.session(&destination_ref, Some(destination_credentials), "pull,push");

        let manifest = from.get_manifest(source_ref.manifest_reference()).await?;
        let document: ManifestDocument = serde_json::from_slice(&manifest.body)
            .with_context(|| format!("Failed to parse manifest of {}", source_ref))?;

        if document.manifests.is_empty() {
            copy_blobs(&mut from, &mut to, &document).await?;
        } else {
            // Every platform manifest must exist before the index referencing it is pushed
            for child in &document.manifests {
                let child_manifest = from.get_manifest(&child.digest).await?;
                let child_document: ManifestDocument =
                    serde_json::from_slice(&child_manifest.body).with_context(|| {
                        format!("Failed to parse manifest {} of {}", child.digest, source_ref)
                    })?;
                copy_blobs(&mut from, &mut to, &child_document).await?;
                to.put_manifest(&child.digest, &child_manifest).await?;
            }
        }

        let target = match &destination_ref.reference {
            TagOrDigest::Tag(tag) => tag.as_str(),
            TagOrDigest::Digest(digest) => digest.as_str(),
        };
        to.put_manifest(target, &manifest).await?;
        info!("Copied image {} to {}", source_ref, destination_ref);
        Ok(())
    }
}

async fn copy_blobs(
    from: &mut RegistrySession<'_>,
    to: &mut RegistrySession<'_>,
    document: &ManifestDocument,
) -> Result<()> {
    for descriptor in document.config.iter().chain(document.layers.iter()) {
        if descriptor.is_foreign() {
            debug!("Skipping foreign layer {}", descriptor.digest);
            continue;
        }
        if to.blob_exists(&descriptor.digest).await? {
            debug!("Blob {} already present in {}", descriptor.digest, to.repository);
            continue;
        }
        let blob = from.get_blob(&descriptor.digest).await?;
        let body = Body::wrap_stream(verify_digest(&descriptor.digest, blob.bytes_stream()));
        to.upload_blob(&descriptor.digest, descriptor.size, body).await?;
    }
    Ok(())
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct DigestCheck<T, E> {
    chunks: BoxStream<'static, std::result::Result<T, E>>,
    hasher: Sha256,
    digest: String,
    finished: bool,
}

/// Passes `chunks` through and fails the stream at its end when the content does not hash to
/// `digest`, so a corrupted blob is never committed. Only sha256 digests are checked.
fn verify_digest<S, T, E>(
    digest: &str,
    chunks: S,
) -> impl Stream<Item = std::result::Result<T, BoxError>> + Send + 'static
where
    S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
    T: AsRef<[u8]> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    let check = DigestCheck {
        chunks: chunks.boxed(),
        hasher: Sha256::new(),
        digest: digest.to_string(),
        finished: false,
    };
    stream::unfold(check, |mut check| async move {
        if check.finished {
            return None;
        }
        match check.chunks.next().await {
            Some(Ok(chunk)) => {
                check.hasher.update(chunk.as_ref());
                Some((Ok(chunk), check))
            }
            Some(Err(e)) => {
                check.finished = true;
                Some((Err(e.into()), check))
            }
            None => {
                check.finished = true;
                let actual = format!("{:x}", std::mem::take(&mut check.hasher).finalize());
                let mismatch = check
                    .digest
                    .strip_prefix("sha256:")
                    .is_some_and(|expected| expected != actual);
                if !mismatch {
                    return None;
                }
                let error: BoxError = format!(
                    "Blob digest mismatch: expected {}, got sha256:{}",
                    check.digest, actual
                )
                .into();
                Some((Err(error), check))
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    digest: String,
    #[serde(default)]
    size: Option<u64>,
}

impl Descriptor {
    fn is_foreign(&self) -> bool {
        self.media_type
            .as_deref()
            .is_some_and(|media_type| media_type.contains("foreign"))
    }
}

struct Manifest {
    body: Vec<u8>,
    media_type: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Connection to one repository on one registry, holding the bearer token once obtained.
struct RegistrySession<'a> {
    client: &'a Client,
    base_url: String,
    repository: String,
    credentials: Option<&'a RegistryCredentials>,
    actions: &'static str,
    token: Option<String>,
}

impl RegistrySession<'_> {
    fn url(&self, path: &str) -> String {
        format!("{}/v2/{}/{}", self.base_url, self.repository, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.token, self.credentials) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(credentials)) => {
                request.basic_auth(credentials.username(), Some(credentials.password()))
            }
            (None, None) => request,
        }
    }

    /// Sends a request, answering a bearer challenge once.
    async fn send<F>(&mut self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self
            .authorize(build(self.client))
            .send()
            .await
            .context("Failed to send registry request")?;
        if response.status() != StatusCode::UNAUTHORIZED || self.token.is_some() {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        self.token = Some(self.fetch_token(&challenge).await?);
        self.authorize(build(self.client))
            .send()
            .await
            .context("Failed to send registry request")
    }

    async fn fetch_token(&self, challenge: &HashMap<String, String>) -> Result<String> {
        let realm = challenge
            .get("realm")
            .context("Bearer challenge does not name a realm")?;
        let scope = format!("repository:{}:{}", self.repository, self.actions);
        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = challenge.get("service") {
            query.push(("service", service.as_str()));
        }

        debug!("Requesting registry token from {} for {}", realm, scope);
        let mut request = self.client.get(realm).query(&query);
        if let Some(credentials) = self.credentials {
            request = request.basic_auth(credentials.username(), Some(credentials.password()));
        }
        let response = ensure_success(
            request.send().await.context("Failed to request registry token")?,
            "requesting registry token",
        )
        .await?;
        let body: TokenResponse = response
            .json()
            .await
            .context("Failed to parse registry token response")?;
        body.token
            .or(body.access_token)
            .context("Registry token response contains no token")
    }

    async fn get_manifest(&mut self, reference: &str) -> Result<Manifest> {
        let url = self.url(&format!("manifests/{}", reference));
        info!("Fetching manifest from URL {}", url);
        let accept = MANIFEST_MEDIA_TYPES.join(", ");
        let response = self
            .send(|client| client.get(&url).header(ACCEPT, accept.as_str()))
            .await?;
        let response = ensure_success(response, "fetching manifest").await?;
        let header_media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let body = response
            .bytes()
            .await
            .context("Failed to read manifest body")?
            .to_vec();

        let media_type = match header_media_type {
            Some(media_type) if MANIFEST_MEDIA_TYPES.contains(&media_type.as_str()) => media_type,
            _ => serde_json::from_slice::<ManifestDocument>(&body)
                .ok()
                .and_then(|document| document.media_type)
                .unwrap_or_else(|| DOCKER_MANIFEST_V2.to_string()),
        };
        Ok(Manifest { body, media_type })
    }

    async fn put_manifest(&mut self, reference: &str, manifest: &Manifest) -> Result<()> {
        let url = self.url(&format!("manifests/{}", reference));
        debug!("Pushing manifest to URL {}", url);
        let response = self
            .send(|client| {
                client
                    .put(&url)
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.body.clone())
            })
            .await?;
        ensure_success(response, "pushing manifest").await?;
        Ok(())
    }

    async fn blob_exists(&mut self, digest: &str) -> Result<bool> {
        let url = self.url(&format!("blobs/{}", digest));
        let response = self.send(|client| client.head(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!(
                "Registry {} returned error status {} while checking blob {}",
                self.base_url,
                status,
                digest
            ),
        }
    }

    async fn get_blob(&mut self, digest: &str) -> Result<Response> {
        let url = self.url(&format!("blobs/{}", digest));
        debug!("Fetching blob from URL {}", url);
        let response = self.send(|client| client.get(&url)).await?;
        ensure_success(response, "fetching blob").await
    }

    /// Uploads a blob in one request. The upload is opened through `send`, so any bearer challenge
    /// is answered before the body, which can only be sent once, goes out.
    async fn upload_blob(&mut self, digest: &str, size: Option<u64>, body: Body) -> Result<()> {
        let start_url = self.url("blobs/uploads/");
        let response = self.send(|client| client.post(&start_url)).await?;
        let response = ensure_success(response, "starting blob upload").await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .context("Blob upload response does not contain a Location header")?;
        let upload_url = if location.starts_with('/') {
            format!("{}{}", self.base_url, location)
        } else {
            location.to_string()
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", upload_url, separator, digest);

        debug!("Uploading blob {} ({:?} bytes)", digest, size);
        let mut request = self
            .authorize(self.client.put(&put_url))
            .header(CONTENT_TYPE, "application/octet-stream");
        if let Some(size) = size {
            request = request.header(CONTENT_LENGTH, size);
        }
        let response = request
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload blob {}", digest))?;
        ensure_success(response, "uploading blob").await?;
        Ok(())
    }
}

/// Parameters of a `Bearer realm="...",service="...",scope="..."` challenge.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let param = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
    Some(
        param
            .captures_iter(params)
            .map(|caps| (caps[1].to_lowercase(), caps[2].to_string()))
            .collect(),
    )
}

async fn ensure_success(response: Response, action: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!(
        "Registry returned error status {} while {} ({}): {}",
        status,
        action,
        url,
        body.chars().take(512).collect::<String>()
    )
}
