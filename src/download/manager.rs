use std::sync::Arc;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::download::orchestrator::{Downloader, FinalReport};
use crate::download::DownloadConfig;
use crate::error::Result;
use crate::pivnet::{PivnetClient, RedirectResolver};
use crate::progress::{ProgressFinish, ProgressReporter};
use crate::proxy::{CredentialProvider, ProxyDialer, TicketSource};
use crate::transport::Connector;
use crate::util::redact_url;

/// Wires configuration into a connector, resolver and downloader, then runs
/// the single download.
pub struct DownloadManager {
    config: DownloadConfig,
    downloader: Downloader<Connector, RedirectResolver<Connector>>,
}

impl DownloadManager {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let credentials = match &config.proxy {
            Some(proxy) => Some(Arc::new(CredentialProvider::new(proxy)?)),
            None => None,
        };
        Self::build(config, credentials)
    }

    /// Same as [`DownloadManager::new`] with an explicit Kerberos ticket
    /// source for SPNEGO proxies.
    pub fn with_ticket_source(config: DownloadConfig, tickets: Arc<dyn TicketSource>) -> Result<Self> {
        let credentials = match &config.proxy {
            Some(proxy) => Some(Arc::new(CredentialProvider::with_ticket_source(proxy, tickets)?)),
            None => None,
        };
        Self::build(config, credentials)
    }

    fn build(config: DownloadConfig, credentials: Option<Arc<CredentialProvider>>) -> Result<Self> {
        let connector = match (&config.proxy, &credentials) {
            (Some(proxy), Some(credentials)) => {
                info!(
                    "using {} proxy {}",
                    proxy.auth,
                    redact_url(proxy.url.as_str())
                );
                let dialer = ProxyDialer::new(proxy.clone(), credentials.clone())?;
                Connector::via_proxy(Arc::new(dialer))?
            }
            _ => Connector::direct()?,
        };
        let connector = Arc::new(connector);
        let client = PivnetClient::new(connector.clone(), &config.pivnet_host, config.api_token.clone())?;
        let resolver = Arc::new(RedirectResolver::new(client));

        let mut downloader = Downloader::new(connector, resolver);
        if let Some(credentials) = credentials {
            downloader = downloader.with_credentials(credentials);
        }
        debug!("download configuration: {:?}", config);
        Ok(Self { config, downloader })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<FinalReport> {
        let reporter = ProgressReporter::spawn(self.config.progress, self.downloader.subscribe());
        let outcome = self
            .downloader
            .download(
                &self.config.artifact,
                &self.config.output_dir,
                &self.config.options,
                &cancel,
            )
            .await;
        if let Some(reporter) = reporter {
            let finish = if outcome.is_ok() {
                ProgressFinish::Success
            } else {
                ProgressFinish::Failure
            };
            reporter.finish(finish).await;
        }
        outcome
    }
}
