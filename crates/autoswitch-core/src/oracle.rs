//! Version oracle
//!
//! The oracle answers "which version should be running right now". Both the
//! supervisor and every worker's drift gate query it; no caching is done
//! here, each call goes to the source.

use crate::error::OracleError;
use crate::types::VersionToken;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Source of the expected version
///
/// Must be safe to call repeatedly and concurrently.
#[async_trait::async_trait]
pub trait VersionOracle: Send + Sync {
    /// Query the currently expected version
    async fn fetch_version(&self) -> Result<VersionToken, OracleError>;
}

/// Reads the expected version from a text file
///
/// Surrounding whitespace is trimmed; an empty file means no version.
#[derive(Debug, Clone)]
pub struct FileOracle {
    path: PathBuf,
}

impl FileOracle {
    /// Create an oracle for `path`
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File this oracle reads
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl VersionOracle for FileOracle {
    async fn fetch_version(&self) -> Result<VersionToken, OracleError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| OracleError::Io {
                path: self.path.clone(),
                source,
            })?;

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(OracleError::NoVersion);
        }
        Ok(VersionToken::new(trimmed))
    }
}

/// Adapts an async closure into an oracle
pub struct FnOracle<F> {
    fetch: F,
}

impl<F> FnOracle<F> {
    /// Wrap `fetch`
    #[inline]
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

impl<F> std::fmt::Debug for FnOracle<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOracle").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<F, Fut> VersionOracle for FnOracle<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<VersionToken, OracleError>> + Send,
{
    async fn fetch_version(&self) -> Result<VersionToken, OracleError> {
        (self.fetch)().await
    }
}
