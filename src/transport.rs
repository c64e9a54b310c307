//! Minimal HTTP/1.1 plumbing shared by the artifact API client and the range
//! downloader: a connection capability, its factory, and the production
//! connector (direct TCP or proxy tunnel, then TLS, then hyper).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::{Position, Url};

use crate::error::{DownloadError, Result};
use crate::proxy::ProxyDialer;
use crate::util::{authority_of, redact_url};

pub const USER_AGENT: &str = concat!("pivnet-fetch/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Any duplex byte stream a connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn Io>;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: Url) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn post_json<T: Serialize>(url: Url, body: &T) -> Result<Self> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| DownloadError::Config(format!("failed to encode request body: {err}")))?;
        let mut request = Self::new(Method::POST, url);
        request.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        request.body = Bytes::from(payload);
        Ok(request)
    }

    pub fn header(mut self, name: HeaderName, value: impl AsRef<str>) -> Result<Self> {
        let value = HeaderValue::from_str(value.as_ref())
            .map_err(|_| DownloadError::Config(format!("invalid value for header {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl HttpResponse {
    /// Response with a fixed in-memory body.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let stream = futures_util::stream::once(async move { Ok(body) });
        Self {
            status,
            headers,
            body: Box::pin(stream),
        }
    }

    pub fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(header::CONTENT_LENGTH)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Collects the whole body. Only for small API payloads.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// One HTTP/1.1 connection to a single origin. Requests are sent one at a
/// time; redirects are never followed.
pub trait Connection: Send + 'static {
    fn send(&mut self, request: HttpRequest) -> impl Future<Output = Result<HttpResponse>> + Send;

    fn is_open(&self) -> bool;
}

/// Opens connections to the origin of a URL.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self, target: Url) -> impl Future<Output = Result<Self::Conn>> + Send;
}

impl<F, Fut, C> ConnectionFactory for F
where
    F: Fn(Url) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C>> + Send,
    C: Connection,
{
    type Conn = C;

    fn connect(&self, target: Url) -> impl Future<Output = Result<Self::Conn>> + Send {
        self(target)
    }
}

pub struct HyperConnection {
    sender: SendRequest<Full<Bytes>>,
}

impl HyperConnection {
    pub async fn handshake(io: BoxedIo, origin: &str) -> Result<Self> {
        let (sender, connection) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|err| DownloadError::Network(format!("HTTP handshake with {origin} failed: {err}")))?;
        let origin = origin.to_string();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("connection to {origin} closed: {err}");
            }
        });
        Ok(Self { sender })
    }
}

impl Connection for HyperConnection {
    async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        self.sender
            .ready()
            .await
            .map_err(|err| DownloadError::Network(format!("connection not usable: {err}")))?;
        let target = redact_url(request.url.as_str());
        let request = into_hyper(request)?;
        let response = self
            .sender
            .send_request(request)
            .await
            .map_err(|err| DownloadError::Network(format!("request to {target} failed: {err}")))?;
        let (parts, body) = response.into_parts();
        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body: incoming_stream(body),
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

fn into_hyper(request: HttpRequest) -> Result<Request<Full<Bytes>>> {
    let HttpRequest {
        method,
        url,
        headers,
        body,
    } = request;
    let path = match &url[Position::BeforePath..Position::AfterQuery] {
        "" => "/",
        path => path,
    };
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(map) = builder.headers_mut() {
        *map = headers;
        if !map.contains_key(header::HOST) {
            map.insert(header::HOST, host_header(&url)?);
        }
        if !map.contains_key(header::USER_AGENT) {
            map.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
    }
    builder
        .body(Full::new(body))
        .map_err(|err| DownloadError::Config(format!("invalid request for {}: {err}", redact_url(url.as_str()))))
}

fn host_header(url: &Url) -> Result<HeaderValue> {
    let host = url
        .host_str()
        .ok_or_else(|| DownloadError::Config(format!("URL has no host: {}", redact_url(url.as_str()))))?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|_| DownloadError::Config(format!("invalid host {host}")))
}

fn incoming_stream(body: Incoming) -> BodyStream {
    Box::pin(futures_util::stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        loop {
            match body.frame().await {
                None => return None,
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Some((Ok(data), Some(body)));
                    }
                }
                Some(Err(err)) if ended_early(&err) => {
                    return Some((
                        Err(DownloadError::Integrity(
                            "response body ended before its declared Content-Length".into(),
                        )),
                        None,
                    ))
                }
                Some(Err(err)) => {
                    return Some((
                        Err(DownloadError::Network(format!("error reading response body: {err}"))),
                        None,
                    ))
                }
            }
        }
    }))
}

/// The peer closed the connection before the body reached its length.
fn ended_early(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

pub fn tls_connector() -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|err| DownloadError::Config(format!("TLS setup failed: {err}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub async fn tls_handshake(tls: &TlsConnector, io: BoxedIo, host: &str) -> Result<BoxedIo> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| DownloadError::Config(format!("invalid TLS server name {host}")))?;
    let stream = tls
        .connect(server_name, io)
        .await
        .map_err(|err| DownloadError::Network(format!("TLS handshake with {host} failed: {err}")))?;
    Ok(Box::new(stream))
}

pub async fn tcp_connect(authority: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(DownloadError::Network(format!("failed to connect to {authority}: {err}")))
        }
        Err(_) => {
            return Err(DownloadError::Timeout(format!(
                "connecting to {authority} took longer than {connect_timeout:?}"
            )))
        }
    };
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Production connection factory: direct TCP or a proxy tunnel, TLS for
/// `https` targets, then an HTTP/1.1 handshake.
#[derive(Clone)]
pub struct Connector {
    dialer: Option<Arc<ProxyDialer>>,
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl Connector {
    pub fn direct() -> Result<Self> {
        Ok(Self {
            dialer: None,
            tls: tls_connector()?,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn via_proxy(dialer: Arc<ProxyDialer>) -> Result<Self> {
        Ok(Self {
            dialer: Some(dialer),
            ..Self::direct()?
        })
    }

    pub async fn open(&self, target: &Url) -> Result<HyperConnection> {
        let authority = authority_of(target)?;
        let io: BoxedIo = match &self.dialer {
            Some(dialer) => dialer.dial(&authority).await?,
            None => Box::new(tcp_connect(&authority, self.connect_timeout).await?),
        };
        let io = match target.scheme() {
            "https" => {
                let host = target.host_str().unwrap_or_default();
                tls_handshake(&self.tls, io, host).await?
            }
            "http" => io,
            other => {
                return Err(DownloadError::Config(format!(
                    "unsupported URL scheme {other}"
                )))
            }
        };
        HyperConnection::handshake(io, &authority).await
    }
}

impl ConnectionFactory for Connector {
    type Conn = HyperConnection;

    async fn connect(&self, target: Url) -> Result<HyperConnection> {
        self.open(&target).await
    }
}
