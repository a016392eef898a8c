use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced while mirroring a workload. The reconciler logs every one of them and retries
/// after a fixed delay; none of them is fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("malformed registry credential document: {0}")]
    Format(String),

    #[error("failed to encode registry credential document: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("object store request failed: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to copy image {source_image} to {destination_image}: {cause:#}")]
    Copy {
        source_image: String,
        destination_image: String,
        #[source]
        cause: anyhow::Error,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    #[cfg(test)]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Store(Box::new(e))
    }
}
