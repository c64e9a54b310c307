//! Client for the Pivotal Network artifact service and the resolver that
//! turns an artifact handle into a pre-signed download link.

mod client;
mod models;
mod resolver;

pub use client::{PivnetClient, DEFAULT_HOST};
pub use models::{ProductFile, Release, ReleaseDependency};
pub use resolver::{select_exact_release, select_file, select_release, select_stemcell, RedirectResolver};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use url::Url;

use crate::checksum::Checksum;
use crate::error::{DownloadError, Result};
use crate::util::redact_url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// Exactly this release version.
    Exact(String),
    /// The highest release whose whole version matches the pattern.
    Regex(String),
}

/// What the caller asked for: product, version and file pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub product_slug: String,
    pub version: VersionSpec,
    pub file_glob: String,
}

impl ArtifactHandle {
    pub fn new(
        product_slug: impl Into<String>,
        version_regex: impl Into<String>,
        file_glob: impl Into<String>,
    ) -> Self {
        Self {
            product_slug: product_slug.into(),
            version: VersionSpec::Regex(version_regex.into()),
            file_glob: file_glob.into(),
        }
    }

    pub fn exact(
        product_slug: impl Into<String>,
        version: impl Into<String>,
        file_glob: impl Into<String>,
    ) -> Self {
        Self {
            product_slug: product_slug.into(),
            version: VersionSpec::Exact(version.into()),
            file_glob: file_glob.into(),
        }
    }
}

/// The stemcell release a product release depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemcellRelease {
    pub slug: String,
    pub version: String,
}

/// Pre-signed URL. Formatting never shows the query string.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedUrl(Url);

impl SignedUrl {
    pub fn new(url: Url) -> Self {
        Self(url)
    }

    /// The full URL, signature included. Never log the result.
    pub fn expose(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for SignedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact_url(self.0.as_str()))
    }
}

impl fmt::Debug for SignedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedUrl({self})")
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub url: SignedUrl,
    pub length: u64,
    pub digest: Option<Checksum>,
    pub accepts_ranges: bool,
    /// Last segment of the product file's object key.
    pub file_name: String,
    pub version: String,
    pub release_id: u64,
    pub product_file_id: u64,
}

/// Anything that can turn a handle into a fresh download link.
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self, handle: &ArtifactHandle) -> impl Future<Output = Result<ResolvedArtifact>> + Send;

    /// Highest stemcell release among the dependencies of `release_id`.
    fn latest_stemcell(
        &self,
        slug: &str,
        release_id: u64,
    ) -> impl Future<Output = Result<StemcellRelease>> + Send {
        let message = format!("no stemcell dependency known for {slug} release {release_id}");
        async move { Err(DownloadError::NotFound(message)) }
    }
}

impl<R: Resolve> Resolve for Arc<R> {
    fn resolve(&self, handle: &ArtifactHandle) -> impl Future<Output = Result<ResolvedArtifact>> + Send {
        self.as_ref().resolve(handle)
    }

    fn latest_stemcell(
        &self,
        slug: &str,
        release_id: u64,
    ) -> impl Future<Output = Result<StemcellRelease>> + Send {
        self.as_ref().latest_stemcell(slug, release_id)
    }
}
