use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    pub id: u64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductFile {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub aws_object_key: String,
    #[serde(default)]
    pub file_version: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReleasesEnvelope {
    #[serde(default)]
    pub releases: Vec<Release>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProductFilesEnvelope {
    #[serde(default)]
    pub product_files: Vec<ProductFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductRef {
    pub slug: String,
}

/// A release another release depends on, such as the stemcell line a tile
/// was built against.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DependentRelease {
    pub id: u64,
    pub version: String,
    pub product: ProductRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseDependency {
    pub release: DependentRelease,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DependenciesEnvelope {
    #[serde(default)]
    pub dependencies: Vec<ReleaseDependency>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AccessTokenRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Deserialize)]
pub(crate) struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub message: Option<String>,
}
