use std::cmp::min;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header;
use http::StatusCode;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::{self, JoinSet};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::download::link::SharedLink;
use crate::download::plan::Chunk;
use crate::download::retry::{RetryPolicy, DEFAULT_RETRIES};
use crate::download::session::{write_all_at, DownloadSession};
use crate::error::{DownloadError, Result};
use crate::pivnet::{Resolve, SignedUrl};
use crate::progress::ProgressEvent;
use crate::scheduler::{FailureOutcome, Scheduler};
use crate::transport::{Connection, ConnectionFactory, HttpRequest, HttpResponse};
use crate::util::{format_bytes, origin_of};

const WRITE_BUFFER_SIZE: usize = 512 << 10;
const REFERER: &str = "https://go-pivnet.network.pivotal.io";
pub const MAX_CONCURRENCY: usize = 32;

/// Default worker count: six, or fewer on small machines.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(6)
}

#[derive(Debug, Clone)]
pub struct RangeOptions {
    pub concurrency: usize,
    pub retries: u32,
    pub retry: RetryPolicy,
    /// Bound on connecting and on waiting for a response head.
    pub op_timeout: Duration,
    /// Bound on waiting for each body frame.
    pub read_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retries: DEFAULT_RETRIES,
            retry: RetryPolicy::default(),
            op_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_millis(250),
        }
    }
}

/// Fills a session's destination file with parallel ranged GETs.
pub struct RangeDownloader<F, R> {
    factory: Arc<F>,
    link: Arc<SharedLink<R>>,
    options: RangeOptions,
    progress: broadcast::Sender<ProgressEvent>,
}

impl<F: ConnectionFactory, R: Resolve> RangeDownloader<F, R> {
    pub fn new(
        factory: Arc<F>,
        link: Arc<SharedLink<R>>,
        options: RangeOptions,
        progress: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            factory,
            link,
            options,
            progress,
        }
    }

    pub async fn fetch(&self, session: &DownloadSession) -> Result<()> {
        let snapshot = session.scheduler.snapshot().await;
        let workers = self
            .options
            .concurrency
            .clamp(1, MAX_CONCURRENCY)
            .min(snapshot.pending.max(1));
        let cancel = session.cancel.child_token();
        let shared = Arc::new(Shared {
            factory: self.factory.clone(),
            link: self.link.clone(),
            scheduler: session.scheduler.clone(),
            file: session.file().clone(),
            path: session.path().display().to_string(),
            total: session.artifact.length,
            ranged: session.artifact.accepts_ranges,
            bytes: AtomicU64::new(0),
            remaining: AtomicUsize::new(snapshot.remaining()),
            options: self.options.clone(),
            progress: self.progress.clone(),
            cancel: cancel.clone(),
            deadline: session.deadline,
        });

        info!(
            "downloading {} in {} chunk(s) with {workers} worker(s)",
            format_bytes(session.artifact.length),
            snapshot.total
        );
        shared.emit();

        let mut join_set = JoinSet::new();
        for id in 0..workers {
            join_set.spawn(Worker::new(id, shared.clone()).run());
        }

        let mut first_error: Option<DownloadError> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined.unwrap_or_else(|err| {
                Err(DownloadError::Network(format!("download worker failed: {err}")))
            });
            if let Err(err) = outcome {
                let replace = match &first_error {
                    None => true,
                    Some(DownloadError::Cancelled) => !matches!(err, DownloadError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    debug!("stopping workers: {err}");
                    first_error = Some(err);
                }
                cancel.cancel();
            }
        }

        if session.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if session.scheduler.has_remaining().await {
            return Err(DownloadError::Integrity(
                "download finished with unfetched chunks".into(),
            ));
        }

        let file = session.file().clone();
        let path = session.path().to_path_buf();
        task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|err| DownloadError::Network(format!("sync task failed: {err}")))?
            .map_err(|err| DownloadError::io(&path, err))?;
        shared.emit();

        if let Some(digest) = &session.artifact.digest {
            info!("verifying {} digest", digest.algorithm());
            digest.verify_file(session.path()).await?;
        }
        Ok(())
    }
}

struct Shared<F, R> {
    factory: Arc<F>,
    link: Arc<SharedLink<R>>,
    scheduler: Arc<Scheduler>,
    file: Arc<std::fs::File>,
    path: String,
    total: u64,
    ranged: bool,
    bytes: AtomicU64,
    remaining: AtomicUsize,
    options: RangeOptions,
    progress: broadcast::Sender<ProgressEvent>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl<F, R> Shared<F, R> {
    fn emit(&self) {
        // no subscribers is fine
        let _ = self.progress.send(ProgressEvent {
            bytes_completed: self.bytes.load(Ordering::Relaxed),
            total_bytes: self.total,
            chunks_remaining: self.remaining.load(Ordering::Relaxed),
        });
    }

    fn op_deadline(&self, limit: Duration) -> Instant {
        min(Instant::now() + limit, self.deadline)
    }
}

enum ChunkError {
    /// `403`: the signed link expired.
    Expired,
    /// Worth another attempt within the chunk's budget.
    Transient(DownloadError),
    Fatal(DownloadError),
}

impl From<DownloadError> for ChunkError {
    fn from(err: DownloadError) -> Self {
        if err.is_transient() {
            ChunkError::Transient(err)
        } else {
            ChunkError::Fatal(err)
        }
    }
}

struct Worker<F: ConnectionFactory, R> {
    id: usize,
    shared: Arc<Shared<F, R>>,
    /// Keep-alive connection and the origin it points at.
    slot: Option<(String, F::Conn)>,
    last_emit: Instant,
}

impl<F: ConnectionFactory, R: Resolve> Worker<F, R> {
    fn new(id: usize, shared: Arc<Shared<F, R>>) -> Self {
        Self {
            id,
            shared,
            slot: None,
            last_emit: Instant::now(),
        }
    }

    async fn run(mut self) -> Result<()> {
        let shared = self.shared.clone();
        loop {
            if shared.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if Instant::now() >= shared.deadline {
                return Err(DownloadError::Timeout("session deadline exceeded".into()));
            }
            let Some(chunk) = shared.scheduler.next_chunk().await else {
                return Ok(());
            };
            if chunk.is_empty() {
                shared.scheduler.on_chunk_complete(chunk.id).await;
                shared.remaining.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            let (url, generation) = shared.link.current().await;
            match self.fetch_chunk(&chunk, &url).await {
                Ok(()) => {
                    shared.scheduler.on_chunk_complete(chunk.id).await;
                    shared.remaining.fetch_sub(1, Ordering::Relaxed);
                    self.maybe_emit();
                }
                Err(ChunkError::Expired) => {
                    self.slot = None;
                    debug!("worker {}: link expired on chunk {}", self.id, chunk.id);
                    shared.scheduler.release(chunk.id).await;
                    shared.link.refresh(generation).await?;
                }
                Err(ChunkError::Transient(err)) => {
                    self.slot = None;
                    if Instant::now() >= shared.deadline {
                        return Err(DownloadError::Timeout(format!(
                            "session deadline exceeded while retrying chunk {}",
                            chunk.id
                        )));
                    }
                    let reason = err.to_string();
                    match shared.scheduler.on_chunk_failed(chunk.id, &reason).await {
                        FailureOutcome::Retry { attempt } => {
                            let delay = shared.options.retry.delay(attempt);
                            warn!(
                                "chunk {} failed on attempt {attempt}: {reason}; retrying in {delay:?}",
                                chunk.id
                            );
                            tokio::select! {
                                _ = shared.cancel.cancelled() => return Err(DownloadError::Cancelled),
                                _ = sleep(delay) => {}
                            }
                            shared.scheduler.requeue(chunk.id).await;
                        }
                        FailureOutcome::Exhausted { attempts } => {
                            return Err(DownloadError::ChunkFailed {
                                id: chunk.id,
                                attempts,
                                reason,
                            });
                        }
                    }
                }
                Err(ChunkError::Fatal(err)) => {
                    self.slot = None;
                    return Err(err);
                }
            }
        }
    }

    fn maybe_emit(&mut self) {
        if self.last_emit.elapsed() >= self.shared.options.progress_interval {
            self.last_emit = Instant::now();
            self.shared.emit();
        }
    }

    /// One attempt at a chunk. Bytes counted towards progress are taken back
    /// when the attempt fails.
    async fn fetch_chunk(&mut self, chunk: &Chunk, url: &SignedUrl) -> Result<(), ChunkError> {
        let mut counted = 0u64;
        let result = self.transfer(chunk, url, &mut counted).await;
        if result.is_err() && counted > 0 {
            self.shared.bytes.fetch_sub(counted, Ordering::Relaxed);
        }
        result
    }

    async fn transfer(
        &mut self,
        chunk: &Chunk,
        url: &SignedUrl,
        counted: &mut u64,
    ) -> Result<(), ChunkError> {
        let shared = self.shared.clone();
        let target = url.expose().clone();
        let origin = origin_of(&target);

        let stale = match &self.slot {
            Some((current, connection)) => *current != origin || !connection.is_open(),
            None => true,
        };
        if stale {
            self.slot = None;
            let connection = guarded(
                &shared.cancel,
                shared.op_deadline(shared.options.op_timeout),
                shared.factory.connect(target.clone()),
            )
            .await?;
            self.slot = Some((origin, connection));
        }
        let Some((_, connection)) = self.slot.as_mut() else {
            return Err(ChunkError::Fatal(DownloadError::Network(
                "no connection available".into(),
            )));
        };

        let mut request = HttpRequest::get(target).header(header::REFERER, REFERER)?;
        if shared.ranged {
            if let Some(range) = chunk.range_header() {
                request = request.header(header::RANGE, range)?;
            }
        }
        let response = guarded(
            &shared.cancel,
            shared.op_deadline(shared.options.op_timeout),
            connection.send(request),
        )
        .await?;

        check_response(&response, chunk, shared.total, shared.options.retries)?;
        self.stream_body(response, chunk, counted).await
    }

    async fn stream_body(
        &mut self,
        mut response: HttpResponse,
        chunk: &Chunk,
        counted: &mut u64,
    ) -> Result<(), ChunkError> {
        let shared = self.shared.clone();
        let capacity = min(WRITE_BUFFER_SIZE as u64, chunk.len()) as usize;
        let mut buffer = Vec::with_capacity(capacity);
        let mut buffer_start = chunk.start;
        let mut position = chunk.start;

        loop {
            let frame = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Err(ChunkError::Fatal(DownloadError::Cancelled)),
                frame = timeout_at(shared.op_deadline(shared.options.read_timeout), response.body.next()) => frame,
            };
            let data = match frame {
                Err(_) => {
                    return Err(ChunkError::Transient(DownloadError::Timeout(format!(
                        "read timed out on chunk {}",
                        chunk.id
                    ))))
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(data))) => data,
            };
            if position + data.len() as u64 > chunk.end {
                return Err(ChunkError::Fatal(DownloadError::Integrity(format!(
                    "server sent more than the {} bytes requested for chunk {}",
                    chunk.len(),
                    chunk.id
                ))));
            }
            position += data.len() as u64;
            buffer.extend_from_slice(&data);
            if buffer.len() >= WRITE_BUFFER_SIZE {
                self.flush(&mut buffer, &mut buffer_start, counted)?;
            }
        }
        self.flush(&mut buffer, &mut buffer_start, counted)?;

        if position < chunk.end {
            return Err(ChunkError::Fatal(DownloadError::Integrity(format!(
                "chunk {} ended {} bytes short",
                chunk.id,
                chunk.end - position
            ))));
        }
        Ok(())
    }

    fn flush(
        &mut self,
        buffer: &mut Vec<u8>,
        buffer_start: &mut u64,
        counted: &mut u64,
    ) -> Result<(), ChunkError> {
        if buffer.is_empty() {
            return Ok(());
        }
        write_all_at(&self.shared.file, buffer, *buffer_start)
            .map_err(|err| ChunkError::Fatal(DownloadError::io(&self.shared.path, err)))?;
        let written = buffer.len() as u64;
        *buffer_start += written;
        *counted += written;
        self.shared.bytes.fetch_add(written, Ordering::Relaxed);
        buffer.clear();
        self.maybe_emit();
        Ok(())
    }
}

/// Races `operation` against cancellation and its deadline.
async fn guarded<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    operation: impl Future<Output = Result<T>>,
) -> Result<T, ChunkError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChunkError::Fatal(DownloadError::Cancelled)),
        outcome = timeout_at(deadline, operation) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ChunkError::Transient(DownloadError::Timeout(
                "no response before the operation deadline".into(),
            ))),
        },
    }
}

fn check_response(
    response: &HttpResponse,
    chunk: &Chunk,
    total: u64,
    budget: u32,
) -> Result<(), ChunkError> {
    let status = response.status;
    match status {
        StatusCode::PARTIAL_CONTENT => {
            if let Some(range) = response.header_str(header::CONTENT_RANGE) {
                if parse_content_range(range) != Some((chunk.start, chunk.end - 1)) {
                    return Err(ChunkError::Fatal(DownloadError::Integrity(format!(
                        "chunk {} answered with range {range}",
                        chunk.id
                    ))));
                }
            }
        }
        StatusCode::OK if chunk.start == 0 && chunk.end == total => {}
        StatusCode::OK => {
            return Err(ChunkError::Fatal(DownloadError::Integrity(format!(
                "server ignored the range request for chunk {}",
                chunk.id
            ))))
        }
        StatusCode::FORBIDDEN => return Err(ChunkError::Expired),
        StatusCode::RANGE_NOT_SATISFIABLE => {
            return Err(ChunkError::Fatal(DownloadError::Integrity(format!(
                "server rejected bytes {}-{} as unsatisfiable",
                chunk.start,
                chunk.end - 1
            ))))
        }
        StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            return Err(ChunkError::Fatal(DownloadError::ProxyAuth(format!(
                "{status} while fetching chunk {}",
                chunk.id
            ))))
        }
        status
            if status.is_server_error()
                || status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::REQUEST_TIMEOUT =>
        {
            return Err(ChunkError::Transient(DownloadError::Network(format!(
                "server returned {status} for chunk {}",
                chunk.id
            ))))
        }
        status => {
            return Err(ChunkError::Fatal(DownloadError::ChunkFailed {
                id: chunk.id,
                attempts: budget.saturating_sub(chunk.retries_left) + 1,
                reason: format!("unexpected status {status}"),
            }))
        }
    }

    if let Some(declared) = response.content_length() {
        if declared != chunk.len() {
            return Err(ChunkError::Fatal(DownloadError::Integrity(format!(
                "chunk {} declared {declared} bytes, expected {}",
                chunk.id,
                chunk.len()
            ))));
        }
    }
    Ok(())
}

/// `bytes start-end/total` to `(start, end)`.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, _total) = range.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}
