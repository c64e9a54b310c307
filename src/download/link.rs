use std::sync::Arc;

use log::{info, warn};
use tokio::sync::Mutex;

use crate::error::{DownloadError, Result};
use crate::pivnet::{ArtifactHandle, Resolve, ResolvedArtifact, SignedUrl};

/// How many times a session may re-resolve an expired link.
pub const MAX_REFRESHES: u32 = 2;

struct LinkState {
    url: SignedUrl,
    generation: u64,
    refreshes: u32,
}

/// Download link shared by all workers of a session. A `403` from the CDN
/// marks the link expired; the first worker to report it re-resolves and the
/// others pick up the new link.
pub struct SharedLink<R> {
    resolver: Arc<R>,
    handle: ArtifactHandle,
    length: u64,
    state: Mutex<LinkState>,
}

impl<R: Resolve> SharedLink<R> {
    pub fn new(resolver: Arc<R>, handle: ArtifactHandle, artifact: &ResolvedArtifact) -> Self {
        Self {
            resolver,
            handle,
            length: artifact.length,
            state: Mutex::new(LinkState {
                url: artifact.url.clone(),
                generation: 0,
                refreshes: 0,
            }),
        }
    }

    /// Current link and its generation.
    pub async fn current(&self) -> (SignedUrl, u64) {
        let state = self.state.lock().await;
        (state.url.clone(), state.generation)
    }

    pub async fn refreshes(&self) -> u32 {
        self.state.lock().await.refreshes
    }

    /// Re-resolves after a `403` observed on `seen_generation`. A no-op when
    /// another worker has already moved the link on.
    pub async fn refresh(&self, seen_generation: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.generation != seen_generation {
            return Ok(());
        }
        if state.refreshes >= MAX_REFRESHES {
            warn!("download link expired again after {} refreshes", state.refreshes);
            return Err(DownloadError::LinkExpired);
        }
        state.refreshes += 1;
        info!(
            "download link expired; re-resolving ({}/{MAX_REFRESHES})",
            state.refreshes
        );
        let fresh = self.resolver.resolve(&self.handle).await?;
        if fresh.length != self.length {
            return Err(DownloadError::Integrity(format!(
                "artifact length changed from {} to {} while re-resolving",
                self.length, fresh.length
            )));
        }
        state.url = fresh.url;
        state.generation += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use url::Url;

    struct CountingResolver {
        calls: AtomicU64,
        length: u64,
    }

    fn artifact(url: &str, length: u64) -> ResolvedArtifact {
        ResolvedArtifact {
            url: SignedUrl::new(Url::parse(url).unwrap()),
            length,
            digest: None,
            accepts_ranges: true,
            file_name: "p.pivotal".into(),
            version: "1.0.0".into(),
            release_id: 1,
            product_file_id: 2,
        }
    }

    impl Resolve for CountingResolver {
        async fn resolve(&self, _handle: &ArtifactHandle) -> Result<ResolvedArtifact> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(artifact(&format!("https://cdn.example.com/p?gen={call}"), self.length))
        }
    }

    fn link(length: u64) -> (Arc<CountingResolver>, SharedLink<CountingResolver>) {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU64::new(0),
            length,
        });
        let link = SharedLink::new(
            resolver.clone(),
            ArtifactHandle::new("p", ".*", "*"),
            &artifact("https://cdn.example.com/p?gen=0", 100),
        );
        (resolver, link)
    }

    #[tokio::test]
    async fn concurrent_expiry_resolves_once() {
        let (resolver, link) = link(100);
        let (_, generation) = link.current().await;
        let (a, b) = tokio::join!(link.refresh(generation), link.refresh(generation));
        a.unwrap();
        b.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        let (url, generation) = link.current().await;
        assert_eq!(generation, 1);
        assert!(url.expose().as_str().ends_with("gen=1"));
    }

    #[tokio::test]
    async fn third_expiry_is_final() {
        let (_, link) = link(100);
        link.refresh(0).await.unwrap();
        link.refresh(1).await.unwrap();
        assert!(matches!(link.refresh(2).await, Err(DownloadError::LinkExpired)));
        assert_eq!(link.refreshes().await, MAX_REFRESHES);
    }

    #[tokio::test]
    async fn changed_length_is_integrity_error() {
        let (_, link) = link(99);
        assert!(matches!(link.refresh(0).await, Err(DownloadError::Integrity(_))));
    }
}
