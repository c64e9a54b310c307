mod support;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use pivnet_fetch::download::DownloadManager;
use pivnet_fetch::proxy::{CredentialProvider, ProxyAuth, ProxyConfig, ProxyDialer};
use pivnet_fetch::DownloadError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

use support::*;

#[tokio::test]
async fn basic_proxy_carries_the_whole_download() {
    let proxy = FakeProxy::start(ProxyMode::Basic("Basic YWxpY2U6czNjcmV0")).await;
    let server = MockServer::start().await;
    let body = payload(60_000);
    mount_artifact(&server, &body, &sha256_hex(&body)).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&server, dir.path());
    config.proxy = Some(
        ProxyConfig::new(proxy.url(), ProxyAuth::Basic).with_credentials("alice", "s3cret"),
    );
    DownloadManager::new(config)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fs::read(artifact_path(dir.path())).unwrap(), body);
    assert!(proxy.tunnels() > 0);
    assert!(proxy
        .authorizations()
        .iter()
        .all(|value| value.as_deref() == Some("Basic YWxpY2U6czNjcmV0")));
}

#[tokio::test]
async fn wrong_basic_password_fails_after_one_retry() {
    let proxy = FakeProxy::start(ProxyMode::Basic("Basic YWxpY2U6czNjcmV0")).await;
    let server = MockServer::start().await;
    let body = payload(10);
    mount_artifact(&server, &body, &sha256_hex(&body)).await;
    let dir = tempfile::tempdir().unwrap();

    let mut config = config(&server, dir.path());
    config.proxy = Some(
        ProxyConfig::new(proxy.url(), ProxyAuth::Basic).with_credentials("alice", "wrong"),
    );
    let err = DownloadManager::new(config)
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::ProxyAuth(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(!err.to_string().contains("wrong"));
    // the first API request of each attempt is refused
    assert_eq!(proxy.authorizations().len(), 2);
    assert_eq!(proxy.tunnels(), 0);
}

#[tokio::test]
async fn spnego_proxy_answers_the_negotiate_challenge() {
    let proxy = FakeProxy::start(ProxyMode::Negotiate("Negotiate Z3NzLXRva2Vu")).await;
    let server = MockServer::start().await;
    let body = payload(50_000);
    mount_artifact(&server, &body, &sha256_hex(&body)).await;
    let dir = tempfile::tempdir().unwrap();
    let tickets = FakeTickets::new(b"gss-token");

    let mut config = config(&server, dir.path());
    config.proxy = Some(spnego_proxy(&proxy));
    DownloadManager::with_ticket_source(config, tickets.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fs::read(artifact_path(dir.path())).unwrap(), body);
    let spns = tickets.spns.lock().unwrap().clone();
    assert!(!spns.is_empty());
    assert!(spns.iter().all(|spn| spn == "HTTP/localhost@EXAMPLE.COM"));

    // every tunnel starts with an unauthenticated CONNECT that draws the 407
    let seen = proxy.authorizations();
    assert_eq!(seen.len(), proxy.tunnels() * 2);
    assert!(seen.iter().any(|value| value.is_none()));
    assert_eq!(tickets.resets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_negotiate_token_resets_tickets_once() {
    let proxy = FakeProxy::start(ProxyMode::Negotiate("Negotiate c29tZXRoaW5nLWVsc2U=")).await;
    let server = MockServer::start().await;
    let body = payload(10);
    mount_artifact(&server, &body, &sha256_hex(&body)).await;
    let dir = tempfile::tempdir().unwrap();
    let tickets = FakeTickets::new(b"gss-token");

    let mut config = config(&server, dir.path());
    config.proxy = Some(spnego_proxy(&proxy));
    let err = DownloadManager::with_ticket_source(config, tickets.clone())
        .unwrap()
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::ProxyAuth(_)));
    assert_eq!(tickets.resets.load(Ordering::SeqCst), 1);
    assert_eq!(tickets.spns.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn dialer_tunnels_raw_bytes() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    });

    let proxy = FakeProxy::start(ProxyMode::Open).await;
    let config = ProxyConfig::new(proxy.url(), ProxyAuth::None);
    let credentials = Arc::new(CredentialProvider::new(&config).unwrap());
    let dialer = ProxyDialer::new(config, credentials).unwrap();

    let mut tunnel = dialer.dial(&echo_addr.to_string()).await.unwrap();
    tunnel.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    tunnel.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello");
    assert_eq!(proxy.authorizations(), vec![None]);
}
