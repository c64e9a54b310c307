use std::sync::Arc;
use std::time::Duration;

use http::header;
use http::StatusCode;
use log::debug;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use url::Url;

use super::models::{
    AccessTokenRequest, AccessTokenResponse, ApiError, DependenciesEnvelope, ProductFile,
    ProductFilesEnvelope, Release, ReleaseDependency, ReleasesEnvelope,
};
use crate::error::{DownloadError, Result};
use crate::transport::{Connection, ConnectionFactory, HttpRequest, HttpResponse};
use crate::util::redact_url;

pub const DEFAULT_HOST: &str = "https://network.pivotal.io";

/// Tokens longer than this are refresh tokens that must be exchanged first.
const LEGACY_TOKEN_LENGTH: usize = 20;
const API_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 5;
const REFERER: &str = "https://go-pivnet.network.pivotal.io";

/// Size and range support learned from a `HEAD` on the download link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHead {
    /// Where the redirect chain ended. Ranged requests go here directly.
    pub url: Url,
    pub length: u64,
    pub accepts_ranges: bool,
}

pub struct PivnetClient<F> {
    factory: Arc<F>,
    base: Url,
    token: String,
    authorization: OnceCell<String>,
}

impl<F: ConnectionFactory> PivnetClient<F> {
    pub fn new(factory: Arc<F>, host: &str, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(DownloadError::Config("a Pivotal Network API token is required".into()));
        }
        let base = Url::parse(&format!("{}/api/v2/", host.trim_end_matches('/')))
            .map_err(|err| DownloadError::Config(format!("invalid artifact service host {host}: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(DownloadError::Config(format!(
                "artifact service host must be http or https: {host}"
            )));
        }
        Ok(Self {
            factory,
            base,
            token,
            authorization: OnceCell::new(),
        })
    }

    pub async fn releases(&self, slug: &str) -> Result<Vec<Release>> {
        let url = self.endpoint(&["products", slug, "releases"])?;
        let envelope: ReleasesEnvelope = self.get_json(url).await?;
        Ok(envelope.releases)
    }

    pub async fn product_files(&self, slug: &str, release_id: u64) -> Result<Vec<ProductFile>> {
        let release = release_id.to_string();
        let url = self.endpoint(&["products", slug, "releases", &release, "product_files"])?;
        let envelope: ProductFilesEnvelope = self.get_json(url).await?;
        Ok(envelope.product_files)
    }

    pub async fn release_dependencies(&self, slug: &str, release_id: u64) -> Result<Vec<ReleaseDependency>> {
        let release = release_id.to_string();
        let url = self.endpoint(&["products", slug, "releases", &release, "dependencies"])?;
        let envelope: DependenciesEnvelope = self.get_json(url).await?;
        Ok(envelope.dependencies)
    }

    /// Accepting an already accepted EULA is a no-op on the service side.
    pub async fn accept_eula(&self, slug: &str, release_id: u64) -> Result<()> {
        let release = release_id.to_string();
        let url = self.endpoint(&[
            "products",
            slug,
            "releases",
            &release,
            "pivnet_resource_eula_acceptance",
        ])?;
        let request = HttpRequest::post_json(url, &serde_json::json!({}))?;
        let request = self.authorize(request).await?;
        let response = self.send(request).await?;
        check_status(response).await?;
        Ok(())
    }

    /// Asks for a download link; the service answers with a redirect to a
    /// short-lived pre-signed URL.
    pub async fn download_link(&self, slug: &str, release_id: u64, file_id: u64) -> Result<Url> {
        let release = release_id.to_string();
        let file = file_id.to_string();
        let url = self.endpoint(&[
            "products",
            slug,
            "releases",
            &release,
            "product_files",
            &file,
            "download",
        ])?;
        let request = HttpRequest::post_json(url.clone(), &serde_json::json!({}))?;
        let request = self.authorize(request).await?;
        let response = self.send(request).await?;
        if response.status.is_redirection() {
            return location(&url, &response);
        }
        check_status(response).await?;
        Err(DownloadError::Network(format!(
            "artifact service did not redirect to a download location for file {file_id}"
        )))
    }

    /// `HEAD` on a download link, following up to five redirects.
    pub async fn head_link(&self, link: &Url) -> Result<LinkHead> {
        let mut current = link.clone();
        for _ in 0..=MAX_REDIRECTS {
            let request = HttpRequest::head(current.clone()).header(header::REFERER, REFERER)?;
            let response = self.send(request).await?;
            if response.status.is_redirection() {
                current = location(&current, &response)?;
                debug!("download link redirected to {}", redact_url(current.as_str()));
                continue;
            }
            match response.status {
                status if status.is_success() => {
                    let length = response.content_length().ok_or_else(|| {
                        DownloadError::Integrity(format!(
                            "no Content-Length for {}",
                            redact_url(current.as_str())
                        ))
                    })?;
                    let accepts_ranges = response
                        .header_str(header::ACCEPT_RANGES)
                        .map(|value| value.to_ascii_lowercase().contains("bytes"))
                        .unwrap_or(false);
                    return Ok(LinkHead {
                        url: current,
                        length,
                        accepts_ranges,
                    });
                }
                StatusCode::FORBIDDEN => {
                    return Err(DownloadError::Auth(format!(
                        "download link was refused: {}",
                        redact_url(current.as_str())
                    )))
                }
                StatusCode::NOT_FOUND => {
                    return Err(DownloadError::NotFound(format!(
                        "download link not found: {}",
                        redact_url(current.as_str())
                    )))
                }
                status => {
                    return Err(DownloadError::Network(format!(
                        "HEAD {} returned {status}",
                        redact_url(current.as_str())
                    )))
                }
            }
        }
        Err(DownloadError::Network(format!(
            "too many redirects following {}",
            redact_url(link.as_str())
        )))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DownloadError::Config("artifact service host cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let request = HttpRequest::get(url).header(header::ACCEPT, "application/json")?;
        let request = self.authorize(request).await?;
        let response = check_status(self.send(request).await?).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|err| DownloadError::Network(format!("unexpected response from artifact service: {err}")))
    }

    async fn authorize(&self, request: HttpRequest) -> Result<HttpRequest> {
        let value = self
            .authorization
            .get_or_try_init(|| self.authorization_value())
            .await?;
        request.header(header::AUTHORIZATION, value)
    }

    async fn authorization_value(&self) -> Result<String> {
        if self.token.len() <= LEGACY_TOKEN_LENGTH {
            return Ok(format!("Token {}", self.token));
        }
        debug!("exchanging refresh token for an access token");
        let url = self.endpoint(&["authentication", "access_tokens"])?;
        let request = HttpRequest::post_json(
            url,
            &AccessTokenRequest {
                refresh_token: &self.token,
            },
        )?;
        let response = check_status(self.send(request).await?).await?;
        let body = response.bytes().await?;
        let token: AccessTokenResponse = serde_json::from_slice(&body)
            .map_err(|err| DownloadError::Auth(format!("could not read access token: {err}")))?;
        Ok(format!("Bearer {}", token.access_token))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let target = redact_url(request.url.as_str());
        let exchange = async {
            let mut connection = self.factory.connect(request.url.clone()).await?;
            connection.send(request).await
        };
        match timeout(API_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout(format!("request to {target} timed out"))),
        }
    }
}

fn location(base: &Url, response: &HttpResponse) -> Result<Url> {
    let value = response.header_str(header::LOCATION).ok_or_else(|| {
        DownloadError::Network(format!("{} redirect without a Location header", response.status))
    })?;
    base.join(value)
        .map_err(|_| DownloadError::Network("redirect to an invalid location".into()))
}

async fn check_status(response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status;
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<ApiError>(&body)
        .ok()
        .and_then(|error| error.message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unexpected status").to_string());
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DownloadError::Auth(format!("{status}: {message}"))
        }
        StatusCode::NOT_FOUND => DownloadError::NotFound(message),
        _ => DownloadError::Network(format!("artifact service returned {status}: {message}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Connector;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, token: &str) -> PivnetClient<Connector> {
        PivnetClient::new(Arc::new(Connector::direct().unwrap()), &server.uri(), token).unwrap()
    }

    #[tokio::test]
    async fn legacy_token_is_sent_as_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/products/redis/releases"))
            .and(header("authorization", "Token legacy-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "releases": [{"id": 1, "version": "1.0.0"}]
            })))
            .mount(&server)
            .await;

        let releases = client(&server, "legacy-token").releases("redis").await.unwrap();
        assert_eq!(releases, vec![Release { id: 1, version: "1.0.0".into() }]);
    }

    #[tokio::test]
    async fn refresh_token_is_exchanged_once() {
        let server = MockServer::start().await;
        let refresh = "a-refresh-token-longer-than-twenty";
        Mock::given(method("POST"))
            .and(path("/api/v2/authentication/access_tokens"))
            .and(body_json(serde_json::json!({"refresh_token": refresh})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-123"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer access-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "releases": []
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server, refresh);
        client.releases("redis").await.unwrap();
        client.releases("redis").await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "message": "token is invalid"
            })))
            .mount(&server)
            .await;

        let err = client(&server, "bad").releases("redis").await.unwrap_err();
        assert!(matches!(err, DownloadError::Auth(ref msg) if msg.contains("token is invalid")));
    }

    #[tokio::test]
    async fn download_link_follows_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/products/redis/releases/4/product_files/9/download"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "https://cdn.example.com/redis.pivotal?sig=1"),
            )
            .mount(&server)
            .await;

        let link = client(&server, "t").download_link("redis", 4, 9).await.unwrap();
        assert_eq!(link.as_str(), "https://cdn.example.com/redis.pivotal?sig=1");
    }

    #[tokio::test]
    async fn head_reads_length_and_ranges() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/files/redis.pivotal"))
            .and(header("referer", REFERER))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 2048])
                    .insert_header("accept-ranges", "bytes"),
            )
            .mount(&server)
            .await;

        let link = Url::parse(&format!("{}/files/redis.pivotal?sig=abc", server.uri())).unwrap();
        let head = client(&server, "t").head_link(&link).await.unwrap();
        assert_eq!(
            head,
            LinkHead {
                url: link,
                length: 2048,
                accepts_ranges: true
            }
        );
    }

    #[tokio::test]
    async fn head_reports_where_the_redirects_ended() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/edge/redis.pivotal"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/cdn/redis.pivotal?sig=2"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/cdn/redis.pivotal"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 10]))
            .mount(&server)
            .await;

        let link = Url::parse(&format!("{}/edge/redis.pivotal?sig=1", server.uri())).unwrap();
        let head = client(&server, "t").head_link(&link).await.unwrap();
        assert_eq!(head.url.path(), "/cdn/redis.pivotal");
        assert_eq!(head.url.query(), Some("sig=2"));
        assert_eq!(head.length, 10);
        assert!(!head.accepts_ranges);
    }

    #[tokio::test]
    async fn dependencies_are_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/products/redis/releases/4/dependencies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "dependencies": [{"release": {
                    "id": 30, "version": "97.57", "product": {"slug": "stemcells-ubuntu-xenial"}
                }}]
            })))
            .mount(&server)
            .await;

        let dependencies = client(&server, "t").release_dependencies("redis", 4).await.unwrap();
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].release.id, 30);
    }
}
