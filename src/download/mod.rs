mod link;
mod manager;
mod orchestrator;
pub mod plan;
mod range;
pub mod retry;
mod session;

pub use link::{SharedLink, MAX_REFRESHES};
pub use manager::DownloadManager;
pub use orchestrator::{
    DownloadOptions, Downloader, FinalReport, StemcellOptions, StemcellReport, DEFAULT_SESSION_TIMEOUT,
};
pub use range::{default_concurrency, RangeDownloader, RangeOptions, MAX_CONCURRENCY};
pub use session::{partial_path, DownloadSession};

use std::fmt;
use std::path::PathBuf;

use crate::pivnet::ArtifactHandle;
use crate::proxy::ProxyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Quiet,
    Text,
    Json,
}

#[derive(Clone)]
pub struct DownloadConfig {
    pub pivnet_host: String,
    pub api_token: String,
    pub artifact: ArtifactHandle,
    pub output_dir: PathBuf,
    pub proxy: Option<ProxyConfig>,
    pub options: DownloadOptions,
    pub progress: ProgressMode,
}

impl fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("pivnet_host", &self.pivnet_host)
            .field("api_token", &"<redacted>")
            .field("artifact", &self.artifact)
            .field("output_dir", &self.output_dir)
            .field("proxy", &self.proxy)
            .field("options", &self.options)
            .field("progress", &self.progress)
            .finish()
    }
}
