use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::fcntl::{fallocate, FallocateFlags};
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

use log::debug;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::download::plan::ChunkPlan;
use crate::error::{DownloadError, Result};
use crate::pivnet::ResolvedArtifact;
use crate::scheduler::Scheduler;
use crate::util::ensure_dir;

const PARTIAL_SUFFIX: &str = ".partial";

/// State of one top-level download: the resolved artifact, its chunk plan,
/// and the pre-sized `<name>.partial` file the chunks land in. The
/// destination itself is only replaced by [`DownloadSession::commit`].
pub struct DownloadSession {
    pub artifact: ResolvedArtifact,
    pub scheduler: Arc<Scheduler>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    path: PathBuf,
    destination: PathBuf,
    file: Arc<File>,
    started: Instant,
}

impl DownloadSession {
    pub fn create(
        artifact: ResolvedArtifact,
        output_dir: &Path,
        chunk_size: u64,
        retries: u32,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<Self> {
        let destination = destination_in(output_dir, &artifact.file_name)?;
        ensure_dir(output_dir)?;
        let path = partial_path(&destination);
        let file = prepare_output_file(&path, artifact.length)?;
        let plan = ChunkPlan::new(artifact.length, chunk_size, artifact.accepts_ranges, retries);
        debug!(
            "planned {} chunk(s) of up to {} bytes for {}",
            plan.chunks.len(),
            plan.chunk_size,
            path.display()
        );
        let started = Instant::now();
        Ok(Self {
            artifact,
            scheduler: Arc::new(Scheduler::new(plan, retries)),
            cancel,
            deadline: started + timeout,
            path,
            destination,
            file: Arc::new(file),
            started,
        })
    }

    /// The partial file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the verified artifact ends up.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Moves the verified partial file over the destination.
    pub fn commit(self) -> Result<PathBuf> {
        let Self {
            path,
            destination,
            file,
            ..
        } = self;
        drop(file);
        fs::rename(&path, &destination).map_err(|err| DownloadError::io(&destination, err))?;
        debug!("moved {} to {}", path.display(), destination.display());
        Ok(destination)
    }

    /// Closes and deletes the partial file.
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DownloadError::io(path, err)),
        }
    }
}

/// Where a product file named `name` lands inside `output_dir`.
pub fn destination_in(output_dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(DownloadError::Config(format!(
            "product file has no usable file name: {name:?}"
        )));
    }
    Ok(output_dir.join(name))
}

/// `<destination>.partial`, next to the destination.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn prepare_output_file(path: &Path, size: u64) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(path)
        .map_err(|err| DownloadError::io(path, err))?;
    preallocate(&file, size).map_err(|err| DownloadError::io(path, err))?;
    Ok(file)
}

fn preallocate(file: &File, size: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        if size > 0 {
            if let Err(err) = fallocate(
                file.as_raw_fd(),
                FallocateFlags::FALLOC_FL_KEEP_SIZE,
                0,
                size as i64,
            ) {
                if err != Errno::ENOTSUP && err != Errno::EINVAL && err != Errno::EOPNOTSUPP {
                    return Err(io::Error::from(err));
                }
            }
        }
        file.set_len(size)
    }

    #[cfg(not(target_os = "linux"))]
    {
        file.set_len(size)
    }
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], position: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, position)
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut position: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let written = file.seek_write(buf, position)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write chunk data",
            ));
        }
        buf = &buf[written..];
        position += written as u64;
    }
    Ok(())
}
