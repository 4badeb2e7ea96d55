//! Artifact resolution ahead of task launches.
//!
//! The shared artifact store itself is an external collaborator; the
//! executor only needs a way to ask for URLs to be fetched into it
//! before a start or restart proceeds.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to fetch {url}: {reason}")]
pub struct ArtifactError {
    pub url: String,
    pub reason: String,
}

/// Fetch one URL into the shared artifact store.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Result<(), ArtifactError>;
}

/// Resolver for setups without an artifact store; accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl ArtifactResolver for NoopResolver {
    fn resolve(&self, _url: &str) -> Result<(), ArtifactError> {
        Ok(())
    }
}
