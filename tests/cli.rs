mod support;

use assert_cmd::Command;
use predicates::prelude::*;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::*;

fn command() -> Command {
    let mut cmd = Command::cargo_bin("pivnet-fetch").unwrap();
    cmd.env_remove("PIVNET_TOKEN")
        .env_remove("PROXY_PASSWORD")
        .env_remove("CACHE_CLEANUP");
    cmd
}

fn with_artifact_args(cmd: &mut Command, host: &str, output: &std::path::Path) {
    cmd.args([
        "--product-slug",
        SLUG,
        "--product-version-regex",
        r"2\..*",
        "--file-glob",
        "*.pivotal",
        "--pivnet-host",
        host,
        "--quiet",
    ])
    .arg("--output-directory")
    .arg(output);
}

#[test]
fn help_exits_zero() {
    command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--proxy-auth-type"));
}

#[test]
fn missing_arguments_are_usage_errors() {
    command().assert().code(1);
}

#[test]
fn missing_token_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = command();
    with_artifact_args(&mut cmd, "http://127.0.0.1:9", dir.path());
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("ConfigError"));
}

#[test]
fn socks_proxy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = command();
    with_artifact_args(&mut cmd, "http://127.0.0.1:9", dir.path());
    cmd.args(["--pivnet-api-token", "t", "--proxy-url", "socks5://proxy.corp:1080"])
        .assert()
        .code(1);
}

#[test]
fn cache_cleanup_without_acknowledgement_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = command();
    with_artifact_args(&mut cmd, "http://127.0.0.1:9", dir.path());
    cmd.args(["--pivnet-api-token", "t"])
        .env("CACHE_CLEANUP", "true")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--cache-cleanup"));
}

#[test]
fn both_version_flags_are_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = command();
    with_artifact_args(&mut cmd, "http://127.0.0.1:9", dir.path());
    cmd.args(["--pivnet-api-token", "t", "--product-version", "2.4.1"])
        .assert()
        .code(1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_reports_the_kept_file() {
    let server = MockServer::start().await;
    let body = payload(9_000);
    mount_artifact(&server, &body, &sha256_hex(&body)).await;
    let dir = tempfile::tempdir().unwrap();
    for skipped in ["\"skipped\":false", "\"skipped\":true"] {
        let mut cmd = command();
        with_artifact_args(&mut cmd, &server.uri(), dir.path());
        cmd.args(["--pivnet-api-token", "legacy-token", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(skipped));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_release_exits_with_resolution_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"releases": []})))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = command();
    with_artifact_args(&mut cmd, &server.uri(), dir.path());
    cmd.env("PIVNET_TOKEN", "legacy-token")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("release not found for version: '2..*'"))
        .stderr(predicate::str::contains("NotFoundError"))
        .stderr(predicate::str::contains("legacy-token").not());
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_download_prints_json_report() {
    let server = MockServer::start().await;
    let body = payload(30_000);
    mount_artifact(&server, &body, &sha256_hex(&body)).await;
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = command();
    with_artifact_args(&mut cmd, &server.uri(), dir.path());
    cmd.args(["--pivnet-api-token", "legacy-token", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"event\":\"report\""))
        .stdout(predicate::str::contains("sig=secret").not());
    assert_eq!(std::fs::read(artifact_path(dir.path())).unwrap(), body);
}
