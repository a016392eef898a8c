use std::fmt;

static DOCKER_HUB_REGISTRY: &str = "docker.io";
static DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
static DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOrDigest {
    Tag(String),
    Digest(String),
}

/// A fully qualified image reference with Docker's defaults applied: `nginx` is
/// `docker.io/library/nginx:latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: TagOrDigest,
}

#[derive(Debug)]
pub enum ParseError {
    Empty,
    MissingRepository(String),
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::MissingRepository(image) => write!(f, "repository is missing: {}", image),
            ParseError::InvalidDigest(image) => write!(f, "invalid digest: {}", image),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for TagOrDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagOrDigest::Tag(tag) => write!(f, ":{}", tag),
            TagOrDigest::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.registry, self.repository, self.reference)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.contains(char::is_whitespace) || s.starts_with('/') || s.ends_with('/') {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                let valid = digest
                    .split_once(':')
                    .is_some_and(|(algorithm, hex)| !algorithm.is_empty() && !hex.is_empty());
                if !valid {
                    return Err(ParseError::InvalidDigest(s.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag
        let last_slash = name.rfind('/').map(|pos| pos + 1).unwrap_or(0);
        let (without_tag, tag) = match name[last_slash..].rfind(':') {
            Some(pos) => {
                let pos = last_slash + pos;
                (&name[..pos], Some(name[pos + 1..].to_string()))
            }
            None => (name, None),
        };
        if tag.as_deref() == Some("") {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (registry, repository) = match without_tag.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (DOCKER_HUB_REGISTRY.to_string(), without_tag.to_string()),
        };
        if repository.is_empty() {
            return Err(ParseError::MissingRepository(s.to_string()));
        }

        let repository = if is_docker_hub(&registry) && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        let reference = match digest {
            Some(digest) => TagOrDigest::Digest(digest),
            None => TagOrDigest::Tag(tag.unwrap_or_else(|| DEFAULT_TAG.to_string())),
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Host serving the registry HTTP API, which differs from the image host for Docker Hub.
    pub fn api_host(&self) -> &str {
        if is_docker_hub(&self.registry) {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Tag or digest as used in a manifest URL.
    pub fn manifest_reference(&self) -> &str {
        match &self.reference {
            TagOrDigest::Tag(tag) => tag,
            TagOrDigest::Digest(digest) => digest,
        }
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_docker_hub(registry: &str) -> bool {
    matches!(
        registry,
        "docker.io" | "index.docker.io" | "registry-1.docker.io"
    )
}

/// Leading path segment of an image as written in a pod spec, used to look up pull credentials.
/// `quay.io/org/app` yields `quay.io`, `library/app` yields `library`.
pub fn source_registry_host(image: &str) -> &str {
    image.split('/').next().unwrap_or(image)
}

/// Destination of `image` in the backup registry: `<registry_url>/<registry_user>/<last segment>`.
///
/// Only the final path segment survives, including its tag or digest, so `orgA/app` and `orgB/app`
/// land on the same destination.
pub fn destination_image(image: &str, registry_url: &str, registry_user: &str) -> String {
    let short_name = image.rsplit('/').next().unwrap_or(image);
    format!("{}/{}/{}", registry_url, registry_user, short_name)
}

/// Whether `image` is already pulled from the backup registry at `registry_url`.
pub fn is_mirrored(image: &str, registry_url: &str) -> bool {
    image
        .strip_prefix(registry_url)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_image_keeps_last_segment() {
        assert_eq!(
            destination_image("quay.io/notcache/image2", "index.docker.io", "user"),
            "index.docker.io/user/image2"
        );
        assert_eq!(
            destination_image("library/image1", "index.docker.io", "user"),
            "index.docker.io/user/image1"
        );
        assert_eq!(
            destination_image("nginx:1.27", "registry.example.com", "backup"),
            "registry.example.com/backup/nginx:1.27"
        );
        assert_eq!(
            destination_image("ghcr.io/org/team/app@sha256:abc", "registry.example.com", "backup"),
            "registry.example.com/backup/app@sha256:abc"
        );
    }

    #[test]
    fn test_source_registry_host() {
        assert_eq!(source_registry_host("quay.io/notcache/image2"), "quay.io");
        assert_eq!(source_registry_host("library/image1"), "library");
        assert_eq!(source_registry_host("nginx"), "nginx");
    }

    #[test]
    fn test_is_mirrored_requires_full_host_match() {
        assert!(is_mirrored("index.docker.io/user/image1", "index.docker.io"));
        assert!(!is_mirrored("index.docker.io.evil.com/user/image1", "index.docker.io"));
        assert!(!is_mirrored("quay.io/index.docker.io/image", "index.docker.io"));
        assert!(!is_mirrored("index.docker.io", "index.docker.io"));
    }

    #[test]
    fn test_parse_applies_docker_defaults() {
        assert_eq!(
            ImageReference::parse("nginx").unwrap(),
            ImageReference {
                registry: "docker.io".to_string(),
                repository: "library/nginx".to_string(),
                reference: TagOrDigest::Tag("latest".to_string()),
            }
        );
        let parsed = ImageReference::parse("library/image1").unwrap();
        assert_eq!(parsed.registry, "docker.io");
        assert_eq!(parsed.repository, "library/image1");
        assert_eq!(parsed.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn test_parse_registry_with_port_and_tag() {
        let parsed = ImageReference::parse("localhost:5000/team/app:v1.2").unwrap();
        assert_eq!(parsed.registry, "localhost:5000");
        assert_eq!(parsed.repository, "team/app");
        assert_eq!(parsed.reference, TagOrDigest::Tag("v1.2".to_string()));
        assert_eq!(parsed.to_string(), "localhost:5000/team/app:v1.2");
    }

    #[test]
    fn test_parse_digest_wins_over_tag() {
        let parsed = ImageReference::parse("quay.io/org/app:v1@sha256:0123abcd").unwrap();
        assert_eq!(parsed.repository, "org/app");
        assert_eq!(parsed.manifest_reference(), "sha256:0123abcd");
        assert_eq!(parsed.to_string(), "quay.io/org/app@sha256:0123abcd");
    }

    #[test]
    fn test_parse_index_docker_io_is_docker_hub() {
        let parsed = ImageReference::parse("index.docker.io/user/image2").unwrap();
        assert_eq!(parsed.api_host(), "registry-1.docker.io");
        assert_eq!(parsed.repository, "user/image2");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(ImageReference::parse(""), Err(ParseError::Empty)));
        assert!(matches!(
            ImageReference::parse("quay.io/app@sha256"),
            Err(ParseError::InvalidDigest(_))
        ));
        assert!(matches!(
            ImageReference::parse("quay.io/app:"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            ImageReference::parse("quay.io/"),
            Err(ParseError::InvalidFormat(_))
        ));
    }
}
