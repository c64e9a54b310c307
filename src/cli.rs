use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use url::Url;

use crate::download::{
    default_concurrency, DownloadConfig, DownloadOptions, ProgressMode, RangeOptions,
    StemcellOptions, MAX_CONCURRENCY,
};
use crate::download::plan::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::download::retry::DEFAULT_RETRIES;
use crate::error::DownloadError;
use crate::pivnet::{ArtifactHandle, DEFAULT_HOST};
use crate::proxy::{ProxyAuth, ProxyConfig};

/// The only `--cache-cleanup` value that enables deleting files.
pub const CACHE_CLEANUP_ACKNOWLEDGEMENT: &str =
    "I acknowledge this will delete files in the output directories";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pivnet-fetch",
    author,
    version,
    about = "Download a product file from the Pivotal Network, through an authenticating proxy if needed",
    long_about = None
)]
pub struct Cli {
    /// Product slug on the Pivotal Network
    #[arg(long = "product-slug", value_name = "slug")]
    pub product_slug: String,

    /// Regular expression the release version must match in full
    #[arg(long = "product-version-regex", value_name = "regex", required_unless_present = "product_version")]
    pub product_version_regex: Option<String>,

    /// Exact release version
    #[arg(long = "product-version", value_name = "version", conflicts_with = "product_version_regex")]
    pub product_version: Option<String>,

    /// Glob selecting exactly one file of the release
    #[arg(long = "file-glob", value_name = "glob")]
    pub file_glob: String,

    /// Directory the artifact and download-file.json are written to
    #[arg(long = "output-directory", value_name = "path")]
    pub output_directory: PathBuf,

    /// Also download the latest stemcell for this IaaS (e.g. aws, vsphere)
    #[arg(long = "stemcell-iaas", value_name = "iaas")]
    pub stemcell_iaas: Option<String>,

    /// Stemcell version to download instead of the latest dependency
    #[arg(long = "stemcell-version", value_name = "version", requires = "stemcell_iaas")]
    pub stemcell_version: Option<String>,

    /// Only accept a heavy stemcell
    #[arg(long = "stemcell-heavy", action = ArgAction::SetTrue, requires = "stemcell_iaas")]
    pub stemcell_heavy: bool,

    /// Directory the stemcell is written to; defaults to the output directory
    #[arg(long = "stemcell-output-directory", value_name = "path", requires = "stemcell_iaas")]
    pub stemcell_output_directory: Option<PathBuf>,

    /// Delete older files matching the globs; takes an acknowledgement phrase
    #[arg(long = "cache-cleanup", env = "CACHE_CLEANUP", value_name = "acknowledgement")]
    pub cache_cleanup: Option<String>,

    #[arg(long = "pivnet-api-token", env = "PIVNET_TOKEN", hide_env_values = true, value_name = "token")]
    pub pivnet_api_token: Option<String>,

    #[arg(long = "pivnet-host", value_name = "url", default_value = DEFAULT_HOST)]
    pub pivnet_host: String,

    /// HTTP proxy URL; empty disables proxying
    #[arg(long = "proxy-url", value_name = "url")]
    pub proxy_url: Option<String>,

    #[arg(long = "proxy-username", value_name = "user")]
    pub proxy_username: Option<String>,

    #[arg(long = "proxy-password", env = "PROXY_PASSWORD", hide_env_values = true, value_name = "password")]
    pub proxy_password: Option<String>,

    /// basic or spnego
    #[arg(long = "proxy-auth-type", value_name = "type")]
    pub proxy_auth_type: Option<String>,

    /// Explicit Kerberos client configuration
    #[arg(long = "proxy-krb5-config", value_name = "path")]
    pub proxy_krb5_config: Option<PathBuf>,

    /// Kerberos realm; defaults to the configuration's default_realm
    #[arg(long = "proxy-realm", value_name = "realm")]
    pub proxy_realm: Option<String>,

    /// Parallel ranged requests (1-32)
    #[arg(long = "download-concurrency", value_name = "int")]
    pub download_concurrency: Option<usize>,

    #[arg(long = "chunk-size-bytes", value_name = "bytes", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size_bytes: u64,

    #[arg(long = "session-timeout-seconds", value_name = "secs", default_value_t = 7200)]
    pub session_timeout_seconds: u64,

    /// Retries per chunk after its first failed attempt
    #[arg(long = "retries", value_name = "int", default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Keep the partial file when the download fails
    #[arg(long = "keep-partial", action = ArgAction::SetTrue)]
    pub keep_partial: bool,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Stream progress as newline-delimited JSON
    #[arg(long = "json", action = ArgAction::SetTrue)]
    pub json: bool,
}

impl Cli {
    pub fn try_parse() -> Result<Self, clap::Error> {
        <Self as Parser>::try_parse()
    }
}

impl TryFrom<Cli> for DownloadConfig {
    type Error = DownloadError;

    fn try_from(cli: Cli) -> Result<Self, DownloadError> {
        let api_token = cli
            .pivnet_api_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                DownloadError::Config("--pivnet-api-token (or PIVNET_TOKEN) is required".into())
            })?;

        let concurrency = cli.download_concurrency.unwrap_or_else(default_concurrency);
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(DownloadError::Config(format!(
                "--download-concurrency must be between 1 and {MAX_CONCURRENCY}, got {concurrency}"
            )));
        }
        if cli.chunk_size_bytes < MIN_CHUNK_SIZE {
            return Err(DownloadError::Config(format!(
                "--chunk-size-bytes must be at least {MIN_CHUNK_SIZE}, got {}",
                cli.chunk_size_bytes
            )));
        }
        if cli.session_timeout_seconds == 0 {
            return Err(DownloadError::Config(
                "--session-timeout-seconds must be positive".into(),
            ));
        }

        let cache_cleanup = match cli.cache_cleanup.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(CACHE_CLEANUP_ACKNOWLEDGEMENT) => true,
            Some(_) => {
                return Err(DownloadError::Config(format!(
                    "--cache-cleanup must be set to '{CACHE_CLEANUP_ACKNOWLEDGEMENT}'"
                )))
            }
        };

        if let Some(dir) = &cli.stemcell_output_directory {
            if !dir.is_dir() {
                return Err(DownloadError::Config(format!(
                    "--stemcell-output-directory {:?} does not exist or is not a directory",
                    dir.display().to_string()
                )));
            }
        }
        let stemcell = cli.stemcell_iaas.map(|iaas| StemcellOptions {
            iaas,
            version: cli.stemcell_version,
            heavy: cli.stemcell_heavy,
            output_dir: cli.stemcell_output_directory,
        });

        let artifact = match (cli.product_version, cli.product_version_regex) {
            (Some(version), _) => ArtifactHandle::exact(cli.product_slug, version, cli.file_glob),
            (None, Some(regex)) => ArtifactHandle::new(cli.product_slug, regex, cli.file_glob),
            (None, None) => {
                return Err(DownloadError::Config(
                    "one of --product-version or --product-version-regex is required".into(),
                ))
            }
        };

        let auth: ProxyAuth = cli.proxy_auth_type.as_deref().unwrap_or_default().parse()?;
        let proxy = match cli.proxy_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|err| DownloadError::Config(format!("invalid --proxy-url: {err}")))?;
                let mut proxy = ProxyConfig::new(url, auth);
                proxy.username = cli.proxy_username;
                proxy.password = cli.proxy_password;
                proxy.realm = cli.proxy_realm;
                proxy.krb5_config = cli.proxy_krb5_config;
                proxy.validate()?;
                Some(proxy)
            }
        };

        let progress = if cli.json {
            ProgressMode::Json
        } else if cli.quiet {
            ProgressMode::Quiet
        } else {
            ProgressMode::Text
        };

        Ok(DownloadConfig {
            pivnet_host: cli.pivnet_host,
            api_token,
            artifact,
            output_dir: cli.output_directory,
            proxy,
            options: DownloadOptions {
                range: RangeOptions {
                    concurrency,
                    retries: cli.retries,
                    ..RangeOptions::default()
                },
                chunk_size: cli.chunk_size_bytes,
                session_timeout: Duration::from_secs(cli.session_timeout_seconds),
                keep_partial: cli.keep_partial,
                cache_cleanup,
                stemcell,
            },
            progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pivnet::VersionSpec;

    const BASE: [&str; 11] = [
        "pivnet-fetch",
        "--product-slug",
        "p-redis",
        "--product-version-regex",
        r"2\..*",
        "--file-glob",
        "*.pivotal",
        "--output-directory",
        "/tmp/out",
        "--pivnet-api-token",
        "token",
    ];

    fn config(extra: &[&str]) -> Result<DownloadConfig, DownloadError> {
        let args: Vec<&str> = BASE.iter().chain(extra).copied().collect();
        DownloadConfig::try_from(Cli::try_parse_from(args).expect("cli parse"))
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let config = config(&[]).unwrap();
        assert_eq!(config.progress, ProgressMode::Text);
        assert_eq!(config.options.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.options.range.retries, 3);
        assert_eq!(config.options.session_timeout, Duration::from_secs(7200));
        assert!(config.options.range.concurrency <= 6);
        assert_eq!(config.pivnet_host, DEFAULT_HOST);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn progress_mode_prefers_json_flag() {
        let config = config(&["--quiet", "--json"]).unwrap();
        assert_eq!(config.progress, ProgressMode::Json);
    }

    #[test]
    fn concurrency_is_bounded() {
        assert!(matches!(config(&["--download-concurrency", "0"]), Err(DownloadError::Config(_))));
        assert!(matches!(config(&["--download-concurrency", "33"]), Err(DownloadError::Config(_))));
        assert_eq!(
            config(&["--download-concurrency", "32"]).unwrap().options.range.concurrency,
            32
        );
    }

    #[test]
    fn small_chunks_are_rejected() {
        let err = config(&["--chunk-size-bytes", "1024"]).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn basic_proxy_needs_credentials() {
        let err = config(&["--proxy-url", "http://proxy.corp:3128", "--proxy-auth-type", "basic"])
            .unwrap_err();
        assert!(matches!(err, DownloadError::Config(_)));

        let config = config(&[
            "--proxy-url",
            "http://proxy.corp:3128",
            "--proxy-auth-type",
            "basic",
            "--proxy-username",
            "alice",
            "--proxy-password",
            "s3cret",
        ])
        .unwrap();
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.auth, ProxyAuth::Basic);
        assert_eq!(proxy.username.as_deref(), Some("alice"));
    }

    #[test]
    fn spnego_rejects_ip_proxies() {
        let err = config(&["--proxy-url", "http://10.0.0.5:3128", "--proxy-auth-type", "spnego"])
            .unwrap_err();
        assert!(matches!(err, DownloadError::Config(_)));
    }

    #[test]
    fn unknown_auth_type_is_a_config_error() {
        let err = config(&["--proxy-url", "http://proxy.corp:3128", "--proxy-auth-type", "ntlm"])
            .unwrap_err();
        assert!(matches!(err, DownloadError::Config(_)));
    }

    #[test]
    fn empty_proxy_url_disables_proxying() {
        assert!(config(&["--proxy-url", ""]).unwrap().proxy.is_none());
    }

    #[test]
    fn exact_version_replaces_the_regex() {
        let args = [
            "pivnet-fetch",
            "--product-slug",
            "p-redis",
            "--product-version",
            "2.4.1",
            "--file-glob",
            "*.pivotal",
            "--output-directory",
            "/tmp/out",
            "--pivnet-api-token",
            "token",
        ];
        let exact = DownloadConfig::try_from(Cli::try_parse_from(args).unwrap()).unwrap();
        assert_eq!(exact.artifact.version, VersionSpec::Exact("2.4.1".into()));
        assert_eq!(
            config(&[]).unwrap().artifact.version,
            VersionSpec::Regex(r"2\..*".into())
        );
    }

    #[test]
    fn version_flags_are_exclusive_and_one_is_required() {
        let both: Vec<&str> = BASE.iter().copied().chain(["--product-version", "2.4.1"]).collect();
        assert!(Cli::try_parse_from(both).is_err());

        let neither: Vec<&str> = BASE
            .iter()
            .copied()
            .filter(|arg| *arg != "--product-version-regex" && *arg != r"2\..*")
            .collect();
        assert!(Cli::try_parse_from(neither).is_err());
    }

    #[test]
    fn stemcell_flags_need_an_iaas() {
        let args: Vec<&str> = BASE.iter().copied().chain(["--stemcell-heavy"]).collect();
        assert!(Cli::try_parse_from(args).is_err());

        let heavy = config(&["--stemcell-iaas", "aws", "--stemcell-version", "97.10", "--stemcell-heavy"]).unwrap();
        assert_eq!(
            heavy.options.stemcell,
            Some(StemcellOptions {
                iaas: "aws".into(),
                version: Some("97.10".into()),
                heavy: true,
                output_dir: None,
            })
        );
        assert_eq!(config(&[]).unwrap().options.stemcell, None);
    }

    #[test]
    fn missing_stemcell_directory_is_rejected() {
        let err = config(&[
            "--stemcell-iaas",
            "aws",
            "--stemcell-output-directory",
            "/nonexistent/stemcells",
        ])
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn cache_cleanup_needs_the_exact_acknowledgement() {
        assert!(!config(&[]).unwrap().options.cache_cleanup);
        assert!(config(&["--cache-cleanup", CACHE_CLEANUP_ACKNOWLEDGEMENT])
            .unwrap()
            .options
            .cache_cleanup);
        let err = config(&["--cache-cleanup", "yes"]).unwrap_err();
        assert!(matches!(err, DownloadError::Config(_)));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = config(&[
            "--proxy-url",
            "http://proxy.corp:3128",
            "--proxy-auth-type",
            "basic",
            "--proxy-username",
            "alice",
            "--proxy-password",
            "s3cret",
        ])
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("\"token\""));
    }
}
