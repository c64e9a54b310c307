use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::checksum::Checksum;
use crate::download::link::SharedLink;
use crate::download::plan::DEFAULT_CHUNK_SIZE;
use crate::download::range::{RangeDownloader, RangeOptions};
use crate::download::session::{destination_in, DownloadSession};
use crate::error::{DownloadError, Result};
use crate::pivnet::{ArtifactHandle, Resolve, ResolvedArtifact};
use crate::progress::ProgressEvent;
use crate::proxy::CredentialProvider;
use crate::sidecar::{Sidecar, SIDECAR_FILE_NAME};
use crate::transport::ConnectionFactory;
use crate::util::format_bytes;

const PROGRESS_CAPACITY: usize = 64;
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(7200);

/// Fetch the stemcell the product release depends on, next to the product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemcellOptions {
    /// IaaS portion of the stemcell file name, e.g. `aws` or `vsphere`.
    pub iaas: String,
    /// Overrides the version taken from the release dependencies.
    pub version: Option<String>,
    /// Only accept full (non-light) stemcells.
    pub heavy: bool,
    /// Defaults to the product's output directory.
    pub output_dir: Option<PathBuf>,
}

impl StemcellOptions {
    /// Light stemcells are preferred unless a heavy one is required.
    pub fn globs(&self) -> Vec<String> {
        let heavy = format!("bosh*{}*", self.iaas);
        if self.heavy {
            vec![heavy]
        } else {
            vec![format!("light*bosh*{}*", self.iaas), heavy]
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub range: RangeOptions,
    pub chunk_size: u64,
    /// Wall-clock bound on one attempt, resolution included.
    pub session_timeout: Duration,
    /// Leave `<name>.partial` behind when a download fails.
    pub keep_partial: bool,
    /// Delete other files matching the glob once the artifact is in place.
    pub cache_cleanup: bool,
    pub stemcell: Option<StemcellOptions>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            range: RangeOptions::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            keep_partial: false,
            cache_cleanup: false,
            stemcell: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemcellReport {
    pub file: PathBuf,
    pub version: String,
    pub bytes: u64,
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct FinalReport {
    pub file: PathBuf,
    pub version: String,
    pub bytes: u64,
    pub elapsed: Duration,
    pub digest: Option<Checksum>,
    /// The destination already held this artifact; nothing was fetched.
    pub skipped: bool,
    pub release_id: u64,
    pub stemcell: Option<StemcellReport>,
}

impl FinalReport {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            self.bytes as f64
        } else {
            self.bytes as f64 / secs
        }
    }
}

/// Drives one download end to end: resolve, fetch, verify, record.
pub struct Downloader<F, R> {
    factory: Arc<F>,
    resolver: Arc<R>,
    credentials: Option<Arc<CredentialProvider>>,
    progress: broadcast::Sender<ProgressEvent>,
}

impl<F: ConnectionFactory, R: Resolve> Downloader<F, R> {
    pub fn new(factory: Arc<F>, resolver: Arc<R>) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            factory,
            resolver,
            credentials: None,
            progress,
        }
    }

    /// Credentials to reset before the single retry after a proxy
    /// authentication failure.
    pub fn with_credentials(mut self, credentials: Arc<CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Downloads the product file, then its stemcell when asked to, and
    /// records both in the side-car. A failure leaves any earlier artifact
    /// and side-car in `output_dir` untouched.
    pub async fn download(
        &self,
        handle: &ArtifactHandle,
        output_dir: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<FinalReport> {
        let mut report = self.fetch(handle, output_dir, options, cancel).await?;
        if options.cache_cleanup {
            clean_cache(output_dir, &handle.file_glob, &report.file)?;
        }
        if let Some(stemcell) = &options.stemcell {
            report.stemcell = self
                .download_stemcell(handle, &report, stemcell, output_dir, options, cancel)
                .await?;
        }

        let mut sidecar = Sidecar::new(
            &report.file,
            &handle.product_slug,
            &report.version,
            report.digest.as_ref(),
            report.bytes,
        );
        if let Some(stemcell) = &report.stemcell {
            sidecar = sidecar.with_stemcell(&stemcell.file, &stemcell.version);
        }
        sidecar.write(output_dir)?;
        Ok(report)
    }

    async fn fetch(
        &self,
        handle: &ArtifactHandle,
        output_dir: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<FinalReport> {
        match self.attempt(handle, output_dir, options, cancel).await {
            Err(DownloadError::ProxyAuth(reason)) => {
                warn!("proxy rejected our credentials ({reason}); retrying once with fresh ones");
                if let Some(credentials) = &self.credentials {
                    credentials.reset().await?;
                }
                self.attempt(handle, output_dir, options, cancel).await
            }
            outcome => outcome,
        }
    }

    async fn attempt(
        &self,
        handle: &ArtifactHandle,
        output_dir: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<FinalReport> {
        let deadline = Instant::now() + options.session_timeout;
        let artifact = self.resolve(handle, cancel, deadline).await?;

        let destination = destination_in(output_dir, &artifact.file_name)?;
        if already_downloaded(&destination, &artifact).await? {
            info!("{} already exists, skip downloading", destination.display());
            return Ok(FinalReport {
                file: destination,
                version: artifact.version,
                bytes: artifact.length,
                elapsed: Duration::ZERO,
                digest: artifact.digest,
                skipped: true,
                release_id: artifact.release_id,
                stemcell: None,
            });
        }

        let session = DownloadSession::create(
            artifact,
            output_dir,
            options.chunk_size,
            options.range.retries,
            cancel.clone(),
            deadline.saturating_duration_since(Instant::now()),
        )?;

        let link = Arc::new(SharedLink::new(
            self.resolver.clone(),
            handle.clone(),
            &session.artifact,
        ));
        let fetcher = RangeDownloader::new(
            self.factory.clone(),
            link,
            options.range.clone(),
            self.progress.clone(),
        );

        if let Err(err) = fetcher.fetch(&session).await {
            abandon(session, options.keep_partial);
            return Err(err);
        }
        let elapsed = session.elapsed();
        let artifact = session.artifact.clone();
        let file = session.commit()?;
        let report = FinalReport {
            file,
            version: artifact.version,
            bytes: artifact.length,
            elapsed,
            digest: artifact.digest,
            skipped: false,
            release_id: artifact.release_id,
            stemcell: None,
        };
        info!(
            "downloaded {} of {} {} in {:.1}s ({}/s)",
            format_bytes(report.bytes),
            handle.product_slug,
            report.version,
            report.elapsed.as_secs_f64(),
            format_bytes(report.bytes_per_second().round() as u64)
        );
        Ok(report)
    }

    async fn download_stemcell(
        &self,
        handle: &ArtifactHandle,
        product: &FinalReport,
        stemcell: &StemcellOptions,
        output_dir: &Path,
        options: &DownloadOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<StemcellReport>> {
        if product.file.extension().and_then(|ext| ext.to_str()) != Some("pivotal") {
            warn!("the downloaded file is not a .pivotal file. Not determining and fetching required stemcell.");
            return Ok(None);
        }
        info!("Downloading stemcell");
        let latest = cancellable(
            cancel,
            self.resolver
                .latest_stemcell(&handle.product_slug, product.release_id),
        )
        .await?;
        let version = stemcell.version.clone().unwrap_or(latest.version);
        let dir = stemcell.output_dir.as_deref().unwrap_or(output_dir);

        let mut last_error = None;
        for glob in stemcell.globs() {
            let stemcell_handle = ArtifactHandle::exact(&latest.slug, &version, &glob);
            match self.fetch(&stemcell_handle, dir, options, cancel).await {
                Ok(report) => {
                    if options.cache_cleanup {
                        clean_cache(dir, &glob, &report.file)?;
                    }
                    return Ok(Some(StemcellReport {
                        file: report.file,
                        version,
                        bytes: report.bytes,
                        skipped: report.skipped,
                    }));
                }
                Err(err @ (DownloadError::NotFound(_) | DownloadError::AmbiguousMatch { .. })) => {
                    debug!("no stemcell for glob '{glob}': {err}");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let reason = last_error.map(|err| err.to_string()).unwrap_or_default();
        let heavy = if stemcell.heavy { "heavy " } else { "" };
        Err(DownloadError::NotFound(format!(
            "could not download stemcell: {reason}\nNo {heavy}stemcell identified for IaaS \"{}\" on Pivotal Network. Correct the `stemcell-iaas` option to match the IaaS portion of the stemcell filename, or remove the option.",
            stemcell.iaas
        )))
    }

    async fn resolve(
        &self,
        handle: &ArtifactHandle,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<ResolvedArtifact> {
        let resolution = async {
            timeout_at(deadline, self.resolver.resolve(handle))
                .await
                .unwrap_or_else(|_| Err(DownloadError::Timeout("resolving the artifact took too long".into())))
        };
        cancellable(cancel, resolution).await
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        outcome = work => outcome,
    }
}

/// True when `destination` already holds the artifact: same length and, when
/// a digest is published, the same digest.
async fn already_downloaded(destination: &Path, artifact: &ResolvedArtifact) -> Result<bool> {
    let metadata = match tokio::fs::metadata(destination).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(DownloadError::io(destination, err)),
    };
    if metadata.len() != artifact.length {
        debug!(
            "{} has {} bytes, expected {}; downloading again",
            destination.display(),
            metadata.len(),
            artifact.length
        );
        return Ok(false);
    }
    let Some(digest) = &artifact.digest else {
        return Ok(true);
    };
    info!("verifying {} digest of existing {}", digest.algorithm(), destination.display());
    match digest.verify_file(destination).await {
        Ok(()) => Ok(true),
        Err(DownloadError::Integrity(reason)) => {
            warn!("{} does not match the published digest ({reason}); downloading again", destination.display());
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

fn abandon(session: DownloadSession, keep_partial: bool) {
    if keep_partial {
        info!("kept partial file {}", session.path().display());
    } else if let Err(err) = session.discard() {
        warn!("could not remove the partial file: {err}");
    }
}

/// Removes every other file in `dir` whose name matches `glob`. The side-car
/// and `keep` survive.
fn clean_cache(dir: &Path, glob: &str, keep: &Path) -> Result<()> {
    let pattern = Pattern::new(glob)
        .map_err(|err| DownloadError::Config(format!("invalid file glob '{glob}': {err}")))?;
    info!(
        "Cleaning up cached artifacts in directory '{}' with the glob '{glob}'",
        dir.display()
    );
    let entries = fs::read_dir(dir).map_err(|err| DownloadError::io(dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| DownloadError::io(dir, err))?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == SIDECAR_FILE_NAME || path == keep || !pattern.matches(name) {
            continue;
        }
        if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            continue;
        }
        info!("cleaning up cached file: {}", path.display());
        if let Err(err) = fs::remove_file(&path) {
            warn!("could not remove {}: {err}", path.display());
        }
    }
    Ok(())
}
