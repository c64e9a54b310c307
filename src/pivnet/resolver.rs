use std::cmp::Ordering;

use glob::Pattern;
use log::info;
use regex::Regex;
use semver::Version;

use super::client::PivnetClient;
use super::models::{ProductFile, Release, ReleaseDependency};
use super::{ArtifactHandle, Resolve, ResolvedArtifact, SignedUrl, StemcellRelease, VersionSpec};
use crate::checksum::Checksum;
use crate::error::{DownloadError, Result};
use crate::transport::ConnectionFactory;
use crate::util::{format_bytes, last_segment};

/// Resolves handles against the artifact service. Holds no state between
/// calls besides the client's access token.
pub struct RedirectResolver<F> {
    client: PivnetClient<F>,
}

impl<F: ConnectionFactory> RedirectResolver<F> {
    pub fn new(client: PivnetClient<F>) -> Self {
        Self { client }
    }
}

impl<F: ConnectionFactory> Resolve for RedirectResolver<F> {
    async fn resolve(&self, handle: &ArtifactHandle) -> Result<ResolvedArtifact> {
        let slug = handle.product_slug.as_str();
        let releases = self.client.releases(slug).await?;
        let release = match &handle.version {
            VersionSpec::Exact(version) => select_exact_release(&releases, version, slug)?,
            VersionSpec::Regex(pattern) => select_release(&releases, pattern)?,
        };

        let files = self.client.product_files(slug, release.id).await?;
        let file = select_file(&files, &handle.file_glob, &release.version)?;

        self.client.accept_eula(slug, release.id).await?;
        let link = self.client.download_link(slug, release.id, file.id).await?;
        let head = self.client.head_link(&link).await?;

        let file_name = last_segment(&file.aws_object_key).to_string();
        info!(
            "resolved {slug} {}: {file_name} ({})",
            release.version,
            format_bytes(head.length)
        );
        Ok(ResolvedArtifact {
            url: SignedUrl::new(head.url),
            length: head.length,
            digest: Checksum::from_published(file.sha256.as_deref(), file.md5.as_deref()),
            accepts_ranges: head.accepts_ranges,
            file_name,
            version: release.version.clone(),
            release_id: release.id,
            product_file_id: file.id,
        })
    }

    async fn latest_stemcell(&self, slug: &str, release_id: u64) -> Result<StemcellRelease> {
        let dependencies = self
            .client
            .release_dependencies(slug, release_id)
            .await
            .map_err(|err| match err {
                DownloadError::NotFound(message) => DownloadError::NotFound(format!(
                    "could not fetch stemcell dependency for {slug}: {message}"
                )),
                other => other,
            })?;
        let stemcell = select_stemcell(&dependencies)?;
        info!("{slug} depends on {} {}", stemcell.slug, stemcell.version);
        Ok(stemcell)
    }
}

/// Highest version among releases whose version fully matches `pattern`.
pub fn select_release<'a>(releases: &'a [Release], pattern: &str) -> Result<&'a Release> {
    let regex = Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| DownloadError::Config(format!("invalid product version regex: {err}")))?;
    releases
        .iter()
        .filter(|release| regex.is_match(&release.version))
        .max_by(|a, b| compare_versions(&a.version, &b.version))
        .ok_or_else(|| {
            DownloadError::NotFound(format!(
                "release not found for version: '{}'",
                pattern.replace('\\', "")
            ))
        })
}

/// The release whose version equals `version` exactly.
pub fn select_exact_release<'a>(releases: &'a [Release], version: &str, slug: &str) -> Result<&'a Release> {
    releases
        .iter()
        .find(|release| release.version == version)
        .ok_or_else(|| {
            let existing = if releases.is_empty() {
                "none".to_string()
            } else {
                releases
                    .iter()
                    .map(|release| release.version.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            DownloadError::NotFound(format!(
                "no valid versions found for product \"{slug}\" and product version \"{version}\"\nexisting versions: {existing}"
            ))
        })
}

/// Highest `major.minor` version among dependencies whose product slug names
/// a stemcell line. A bare `major` counts as `major.0`.
pub fn select_stemcell(dependencies: &[ReleaseDependency]) -> Result<StemcellRelease> {
    let mut best: Option<((u64, u64), &ReleaseDependency)> = None;
    for dependency in dependencies
        .iter()
        .filter(|dependency| dependency.release.product.slug.contains("stemcells"))
    {
        let parts = stemcell_version_parts(&dependency.release.version)?;
        if best.map_or(true, |(current, _)| parts > current) {
            best = Some((parts, dependency));
        }
    }
    best.map(|(_, dependency)| StemcellRelease {
        slug: dependency.release.product.slug.clone(),
        version: dependency.release.version.clone(),
    })
    .ok_or_else(|| DownloadError::NotFound("the release does not depend on any stemcell".into()))
}

fn stemcell_version_parts(version: &str) -> Result<(u64, u64)> {
    let unexpected = || {
        DownloadError::Network(format!(
            "could not sort stemcell dependency: versioning of stemcell dependency in unexpected format: \"major.minor\" or \"major\". the following version could not be parsed: {version}"
        ))
    };
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|part| part.parse().ok())
        .ok_or_else(unexpected)?;
    let minor = match parts.next() {
        Some(part) => part.parse().map_err(|_| unexpected())?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(unexpected());
    }
    Ok((major, minor))
}

/// The single file whose object key's last segment matches `glob`.
pub fn select_file<'a>(files: &'a [ProductFile], glob: &str, version: &str) -> Result<&'a ProductFile> {
    let pattern = Pattern::new(glob)
        .map_err(|err| DownloadError::Config(format!("invalid file glob '{glob}': {err}")))?;
    let matches: Vec<&ProductFile> = files
        .iter()
        .filter(|file| pattern.matches(last_segment(&file.aws_object_key)))
        .collect();
    match matches.as_slice() {
        [file] => Ok(file),
        [] => Err(DownloadError::NotFound(format!(
            "could not select a file for product version {version}: the glob '{glob}' matches no file"
        ))),
        many => {
            let candidates: Vec<String> = many
                .iter()
                .map(|file| last_segment(&file.aws_object_key).to_string())
                .collect();
            Err(DownloadError::AmbiguousMatch {
                message: format!(
                    "could not select a file for product version {version}: the glob '{glob}' matches multiple files. Write your glob to match exactly one of the following:\n  {}",
                    candidates.join("\n  ")
                ),
                candidates,
            })
        }
    }
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    lenient_semver(a)
        .cmp(&lenient_semver(b))
        .then_with(|| a.cmp(b))
}

/// Parses `1.2` as `1.2.0` and `v3` as `3.0.0`; anything else that is not
/// semver yields `None`, which sorts below every parsed version.
fn lenient_semver(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|part| part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    Version::parse(&format!("{padded}{suffix}")).ok()
}
