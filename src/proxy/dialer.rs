use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{self as aio, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::{Credential, CredentialProvider, ProxyAuth, ProxyConfig};
use crate::error::{DownloadError, Result};
use crate::transport::{self, BoxedIo, USER_AGENT};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_HEAD_BYTES: usize = 16 << 10;
const MAX_HEADERS: usize = 64;

/// Progress of a single `CONNECT` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    Init,
    ConnectedToProxy,
    AuthChallenged,
    AuthenticatedRetry,
    Tunnelled,
    Failed,
}

/// Opens tunnels to arbitrary `host:port` targets through an HTTP proxy.
pub struct ProxyDialer {
    config: ProxyConfig,
    credentials: Arc<CredentialProvider>,
    tls: TlsConnector,
    timeout: Duration,
}

impl ProxyDialer {
    pub fn new(config: ProxyConfig, credentials: Arc<CredentialProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            credentials,
            tls: transport::tls_connector()?,
            timeout: DEFAULT_DIAL_TIMEOUT,
        })
    }

    /// Returns a byte stream tunnelled to `target` (`host:port`). The whole
    /// exchange, Kerberos round trip included, is bounded by the dial timeout.
    pub async fn dial(&self, target: &str) -> Result<BoxedIo> {
        let mut state = DialState::Init;
        let result = match timeout(self.timeout, self.handshake(target, &mut state)).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout(format!(
                "CONNECT {target} through proxy took longer than {:?}",
                self.timeout
            ))),
        };
        match result {
            Ok(io) => {
                debug!("tunnel to {target} established");
                Ok(io)
            }
            Err(err) => {
                debug!("dial to {target} failed in state {state:?}: {err}");
                Err(err)
            }
        }
    }

    async fn handshake(&self, target: &str, state: &mut DialState) -> Result<BoxedIo> {
        let host = self.config.host()?;
        let mut stream = self.connect_proxy(&host).await?;
        transition(state, DialState::ConnectedToProxy);

        // basic credentials go out pre-emptively, Negotiate only after a 407
        let initial = match self.config.auth {
            ProxyAuth::Basic => self.credentials.acquire(&host).await?,
            _ => Credential::None,
        };
        send_connect(&mut stream, target, &initial).await?;
        let head = read_head(&mut stream).await?;

        if head.status == 407 {
            if self.config.auth != ProxyAuth::Spnego {
                transition(state, DialState::Failed);
                return Err(DownloadError::ProxyAuth(format!(
                    "proxy rejected {} credentials for CONNECT {target}",
                    self.config.auth
                )));
            }
            if !head.offers_negotiate() {
                transition(state, DialState::Failed);
                return Err(DownloadError::ProxyAuth(
                    "proxy did not offer Negotiate authentication".into(),
                ));
            }
            transition(state, DialState::AuthChallenged);

            let mut credential = self.credentials.acquire(&host).await?;
            if !drain_body(&mut stream, &head).await {
                debug!("proxy closed the challenged connection; reconnecting");
                stream = self.connect_proxy(&host).await?;
            }
            if credential.is_expired() {
                debug!("Negotiate token expired before the authenticated retry; requesting another");
                credential = self.credentials.acquire(&host).await?;
            }
            transition(state, DialState::AuthenticatedRetry);
            send_connect(&mut stream, target, &credential).await?;
            let retry = read_head(&mut stream).await?;
            return self.finish(stream, retry, target, state);
        }

        self.finish(stream, head, target, state)
    }

    fn finish(
        &self,
        stream: BoxedIo,
        head: ResponseHead,
        target: &str,
        state: &mut DialState,
    ) -> Result<BoxedIo> {
        match head.status {
            200..=299 => {
                if !head.leftover.is_empty() {
                    transition(state, DialState::Failed);
                    return Err(DownloadError::ProxyProtocol(format!(
                        "proxy sent {} unexpected byte(s) after establishing the tunnel",
                        head.leftover.len()
                    )));
                }
                transition(state, DialState::Tunnelled);
                Ok(stream)
            }
            407 => {
                transition(state, DialState::Failed);
                warn!("proxy rejected the Negotiate token for CONNECT {target}");
                Err(DownloadError::ProxyAuth(format!(
                    "proxy rejected the Negotiate token for CONNECT {target}"
                )))
            }
            status => {
                transition(state, DialState::Failed);
                Err(DownloadError::ProxyProtocol(format!(
                    "proxy answered CONNECT {target} with {status} {}",
                    head.reason
                )))
            }
        }
    }

    async fn connect_proxy(&self, host: &str) -> Result<BoxedIo> {
        let authority = format!("{}:{}", self.config.url.host_str().unwrap_or(host), self.config.port()?);
        let stream = transport::tcp_connect(&authority, self.timeout).await?;
        if self.config.is_tls() {
            transport::tls_handshake(&self.tls, Box::new(stream), host).await
        } else {
            Ok(Box::new(stream))
        }
    }
}

fn transition(state: &mut DialState, next: DialState) {
    debug!("proxy dial {:?} -> {:?}", state, next);
    *state = next;
}

async fn send_connect<S>(stream: &mut S, target: &str, credential: &Credential) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: {USER_AGENT}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(value) = credential.header_value() {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| DownloadError::Network(format!("failed to send CONNECT: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| DownloadError::Network(format!("failed to send CONNECT: {err}")))
}

#[derive(Debug)]
struct ResponseHead {
    status: u16,
    reason: String,
    minor_version: u8,
    headers: Vec<(String, String)>,
    /// Bytes read past the end of the head.
    leftover: Vec<u8>,
}

impl ResponseHead {
    fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn content_length(&self) -> Option<u64> {
        self.values("content-length")
            .next()
            .and_then(|value| value.trim().parse().ok())
    }

    fn offers_negotiate(&self) -> bool {
        self.values("proxy-authenticate").any(|value| {
            value
                .split(',')
                .any(|scheme| scheme.trim().to_ascii_lowercase().starts_with("negotiate"))
        })
    }

    fn keep_alive(&self) -> bool {
        let tokens: Vec<String> = self
            .values("connection")
            .chain(self.values("proxy-connection"))
            .map(|value| value.trim().to_ascii_lowercase())
            .collect();
        if tokens.iter().any(|token| token == "close") {
            return false;
        }
        self.minor_version >= 1 || tokens.iter().any(|token| token == "keep-alive")
    }
}

async fn read_head<S>(stream: &mut S) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| DownloadError::Network(format!("failed to read proxy response: {err}")))?;
        if read == 0 {
            return Err(DownloadError::Network(
                "proxy closed the connection before answering CONNECT".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..read]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let head = ResponseHead {
                    status: response.code.unwrap_or_default(),
                    reason: response.reason.unwrap_or_default().to_string(),
                    minor_version: response.version.unwrap_or(1),
                    headers: response
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect(),
                    leftover: buf[len..].to_vec(),
                };
                return Ok(head);
            }
            Ok(httparse::Status::Partial) if buf.len() >= MAX_HEAD_BYTES => {
                return Err(DownloadError::ProxyProtocol(format!(
                    "proxy response head exceeds {MAX_HEAD_BYTES} bytes"
                )));
            }
            Ok(httparse::Status::Partial) => {}
            Err(err) => {
                return Err(DownloadError::ProxyProtocol(format!(
                    "malformed proxy response: {err}"
                )))
            }
        }
    }
}

/// Consumes the body of a 407 so the connection can carry the authenticated
/// retry. Returns false when the connection cannot be reused.
async fn drain_body<S>(stream: &mut S, head: &ResponseHead) -> bool
where
    S: AsyncRead + Unpin + ?Sized,
{
    if !head.keep_alive() {
        return false;
    }
    let Some(length) = head.content_length() else {
        return false;
    };
    let buffered = head.leftover.len() as u64;
    if buffered > length {
        return false;
    }
    let remaining = length - buffered;
    if remaining == 0 {
        return true;
    }
    let mut limited = stream.take(remaining);
    match aio::copy(&mut limited, &mut aio::sink()).await {
        Ok(copied) => copied == remaining,
        Err(_) => false,
    }
}
