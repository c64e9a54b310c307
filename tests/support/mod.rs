#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use pivnet_fetch::download::retry::RetryPolicy;
use pivnet_fetch::download::{DownloadConfig, DownloadOptions, ProgressMode, RangeOptions};
use pivnet_fetch::pivnet::ArtifactHandle;
use pivnet_fetch::proxy::{ContextToken, TicketSource};
use pivnet_fetch::proxy::ProxyConfig;
use pivnet_fetch::Result;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SLUG: &str = "p-redis";
pub const FILE_NAME: &str = "p-redis-2.4.1.pivotal";
pub const CDN_PATH: &str = "/cdn/p-redis-2.4.1.pivotal";
pub const STEMCELL_SLUG: &str = "stemcells-ubuntu-xenial";
pub const STEMCELL_FILE: &str = "light-bosh-stemcell-97.10-aws-xen-hvm-ubuntu-xenial-go_agent.tgz";

/// Deterministic artifact body.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Serves byte ranges of a fixed body, the way a CDN answers ranged GETs.
pub struct RangeResponder {
    body: Vec<u8>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|value| value.split_once('-'))
            .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));
        match range {
            Some((start, end)) if start <= end && end < total => ResponseTemplate::new(206)
                .insert_header("content-range", format!("bytes {start}-{end}/{total}").as_str())
                .set_body_bytes(self.body[start..=end].to_vec()),
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

/// Mounts the release listing, file listing, EULA, download-link and CDN
/// endpoints for one artifact on `server`.
pub async fn mount_artifact(server: &MockServer, body: &[u8], sha256: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/products/{SLUG}/releases")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "releases": [
                {"id": 1, "version": "2.3.0"},
                {"id": 2, "version": "2.4.1"},
                {"id": 3, "version": "3.0.0"}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/products/{SLUG}/releases/2/product_files")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "product_files": [
                {"id": 9, "aws_object_key": format!("product-files/{SLUG}/{FILE_NAME}"), "sha256": sha256},
                {"id": 10, "aws_object_key": format!("product-files/{SLUG}/p-redis-2.4.1.tgz")}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/api/v2/products/{SLUG}/releases/2/pivnet_resource_eula_acceptance"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
    mount_download_link(server).await;
    Mock::given(method("HEAD"))
        .and(path(CDN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(CDN_PATH))
        .respond_with(RangeResponder::new(body.to_vec()))
        .mount(server)
        .await;
}

/// Mounts a release dependency on the stemcell line plus the endpoints for
/// one light AWS stemcell file.
pub async fn mount_stemcell(server: &MockServer, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/products/{SLUG}/releases/2/dependencies")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "dependencies": [
                {"release": {"id": 40, "version": "97.10", "product": {"slug": STEMCELL_SLUG}}},
                {"release": {"id": 39, "version": "97.9", "product": {"slug": STEMCELL_SLUG}}}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/products/{STEMCELL_SLUG}/releases")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "releases": [{"id": 39, "version": "97.9"}, {"id": 40, "version": "97.10"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/products/{STEMCELL_SLUG}/releases/40/product_files")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "product_files": [
                {"id": 41, "aws_object_key": format!("product-files/{STEMCELL_SLUG}/{STEMCELL_FILE}"), "sha256": sha256_hex(body)},
                {"id": 42, "aws_object_key": format!("product-files/{STEMCELL_SLUG}/bosh-stemcell-97.10-vsphere-esxi-ubuntu-xenial-go_agent.tgz")}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/api/v2/products/{STEMCELL_SLUG}/releases/40/pivnet_resource_eula_acceptance"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/api/v2/products/{STEMCELL_SLUG}/releases/40/product_files/41/download"
        )))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("{}/cdn/{STEMCELL_FILE}?sig=stem", server.uri()).as_str()),
        )
        .mount(server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/cdn/{STEMCELL_FILE}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/cdn/{STEMCELL_FILE}")))
        .respond_with(RangeResponder::new(body.to_vec()))
        .mount(server)
        .await;
}

pub async fn mount_download_link(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!(
            "/api/v2/products/{SLUG}/releases/2/product_files/9/download"
        )))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("{}{CDN_PATH}?sig=secret", server.uri()).as_str()),
        )
        .mount(server)
        .await;
}

pub fn config(server: &MockServer, output_dir: &Path) -> DownloadConfig {
    DownloadConfig {
        pivnet_host: server.uri(),
        api_token: "legacy-token".into(),
        artifact: ArtifactHandle::new(SLUG, r"2\..*", "*.pivotal"),
        output_dir: output_dir.to_path_buf(),
        proxy: None,
        options: DownloadOptions {
            range: RangeOptions {
                concurrency: 4,
                retries: 2,
                retry: RetryPolicy::immediate(),
                ..RangeOptions::default()
            },
            chunk_size: 16 << 10,
            ..DownloadOptions::default()
        },
        progress: ProgressMode::Quiet,
    }
}

pub fn artifact_path(output_dir: &Path) -> PathBuf {
    output_dir.join(FILE_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Open,
    /// Requires this exact `Proxy-Authorization` value, answering Basic 407s.
    Basic(&'static str),
    /// Challenges with `Negotiate` until this value is presented.
    Negotiate(&'static str),
}

/// Minimal CONNECT proxy: checks `Proxy-Authorization`, then splices bytes
/// to the requested target.
pub struct FakeProxy {
    pub port: u16,
    seen: Arc<Mutex<Vec<Option<String>>>>,
    tunnels: Arc<AtomicUsize>,
}

impl FakeProxy {
    pub async fn start(mode: ProxyMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tunnels = Arc::new(AtomicUsize::new(0));
        let (seen_task, tunnels_task) = (seen.clone(), tunnels.clone());
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen_task.clone();
                let tunnels = tunnels_task.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, mode, seen, tunnels).await;
                });
            }
        });
        Self { port, seen, tunnels }
    }

    /// Proxy URL by hostname, as SPNEGO requires.
    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://localhost:{}", self.port)).unwrap()
    }

    pub fn authorizations(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn tunnels(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut socket: TcpStream,
    mode: ProxyMode,
    seen: Arc<Mutex<Vec<Option<String>>>>,
    tunnels: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    loop {
        let Some(head) = read_request_head(&mut socket).await? else {
            return Ok(());
        };
        let target = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string();
        let authorization = head.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("proxy-authorization")
                .then(|| value.trim().to_string())
        });
        seen.lock().unwrap().push(authorization.clone());

        let accepted = match mode {
            ProxyMode::Open => true,
            ProxyMode::Basic(expected) | ProxyMode::Negotiate(expected) => {
                authorization.as_deref() == Some(expected)
            }
        };
        if !accepted {
            let scheme = match mode {
                ProxyMode::Negotiate(_) => "Negotiate",
                _ => "Basic realm=\"proxy\"",
            };
            let reply = format!(
                "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: {scheme}\r\nContent-Length: 6\r\n\r\ndenied"
            );
            socket.write_all(reply.as_bytes()).await?;
            if matches!(mode, ProxyMode::Negotiate(_)) {
                continue;
            }
            return Ok(());
        }

        let mut upstream = TcpStream::connect(target.as_str()).await?;
        tunnels.fetch_add(1, Ordering::SeqCst);
        socket
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
        return Ok(());
    }
}

async fn read_request_head(socket: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if socket.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        head.push(byte[0]);
    }
    Ok(Some(String::from_utf8_lossy(&head).into_owned()))
}

/// Ticket source standing in for the KDC.
pub struct FakeTickets {
    token: &'static [u8],
    pub spns: Mutex<Vec<String>>,
    pub resets: AtomicUsize,
}

impl FakeTickets {
    pub fn new(token: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            token,
            spns: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
        })
    }
}

impl TicketSource for FakeTickets {
    fn initial_context_token(&self, spn: &str, _config_path: Option<&Path>) -> Result<ContextToken> {
        self.spns.lock().unwrap().push(spn.to_string());
        Ok(ContextToken {
            bytes: self.token.to_vec(),
            expires_at: SystemTime::now() + Duration::from_secs(300),
        })
    }

    fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn spnego_proxy(proxy: &FakeProxy) -> ProxyConfig {
    ProxyConfig::new(proxy.url(), pivnet_fetch::proxy::ProxyAuth::Spnego).with_realm("EXAMPLE.COM")
}
