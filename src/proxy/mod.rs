//! Outbound HTTP proxy support: configuration, credential acquisition and the
//! `CONNECT` dialer.

mod credential;
mod dialer;
pub mod kerberos;

pub use credential::{Credential, CredentialProvider};
pub use dialer::{DialState, ProxyDialer, DEFAULT_DIAL_TIMEOUT};
pub use kerberos::{ContextToken, TicketSource};

use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::{DownloadError, Result};

/// Authentication scheme presented to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyAuth {
    #[default]
    None,
    Basic,
    Spnego,
}

impl FromStr for ProxyAuth {
    type Err = DownloadError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(ProxyAuth::None),
            "basic" => Ok(ProxyAuth::Basic),
            "spnego" | "negotiate" | "kerberos" => Ok(ProxyAuth::Spnego),
            other => Err(DownloadError::Config(format!(
                "unknown proxy authentication type: {other} (expected basic or spnego)"
            ))),
        }
    }
}

impl fmt::Display for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyAuth::None => "none",
            ProxyAuth::Basic => "basic",
            ProxyAuth::Spnego => "spnego",
        })
    }
}

/// Immutable proxy settings, built once from the command line.
#[derive(Clone)]
pub struct ProxyConfig {
    pub url: Url,
    pub auth: ProxyAuth,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub krb5_config: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn new(url: Url, auth: ProxyAuth) -> Self {
        Self {
            url,
            auth,
            username: None,
            password: None,
            realm: None,
            krb5_config: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_krb5_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.krb5_config = Some(path.into());
        self
    }

    /// Kerberos variables this proxy needs in the process environment. Empty
    /// unless SPNEGO is configured.
    pub fn kerberos_environment(&self) -> Vec<(&'static str, OsString)> {
        if self.auth != ProxyAuth::Spnego {
            return Vec::new();
        }
        let password_login = matches!(
            (&self.username, &self.password),
            (Some(user), Some(_)) if !user.is_empty()
        );
        let cache = password_login.then(kerberos::login_cache_path);
        kerberos::environment(self.krb5_config.as_deref(), cache.as_deref())
    }

    /// Exports [`ProxyConfig::kerberos_environment`].
    ///
    /// Mutating the environment races with any thread reading it, so this must
    /// run while the process is still single-threaded, before the async runtime
    /// is built.
    pub fn export_kerberos_environment(&self) {
        for (name, value) in self.kerberos_environment() {
            std::env::set_var(name, value);
        }
    }

    /// Hostname exactly as written in the proxy URL; this is what the SPN is
    /// built from.
    pub fn host(&self) -> Result<String> {
        self.url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| DownloadError::Config(format!("proxy URL has no host: {}", self.url)))
    }

    pub fn port(&self) -> Result<u16> {
        self.url
            .port_or_known_default()
            .ok_or_else(|| DownloadError::Config(format!("proxy URL has no port: {}", self.url)))
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    pub fn validate(&self) -> Result<()> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DownloadError::Config(format!(
                    "unsupported proxy scheme {other}: only http and https proxies are supported"
                )))
            }
        }
        self.host()?;
        self.port()?;

        match self.auth {
            ProxyAuth::None => {}
            ProxyAuth::Basic => {
                if self.username.as_deref().unwrap_or_default().is_empty()
                    || self.password.is_none()
                {
                    return Err(DownloadError::Config(
                        "proxy-username and proxy-password are required for basic proxy authentication"
                            .into(),
                    ));
                }
            }
            ProxyAuth::Spnego => {
                if is_ip_host(&self.url) {
                    return Err(DownloadError::Config(format!(
                        "spnego proxy authentication needs the proxy's hostname, not an IP address ({})",
                        self.url.host_str().unwrap_or_default()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url.as_str())
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("realm", &self.realm)
            .field("krb5_config", &self.krb5_config)
            .finish()
    }
}

pub(crate) fn is_ip_host(url: &Url) -> bool {
    matches!(url.host(), Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)))
}

pub(crate) fn is_ip_literal(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}
