use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;
use tokio::task;

use super::kerberos::{self, TicketSource, UnavailableTicketSource};
use super::{is_ip_literal, ProxyAuth, ProxyConfig};
use crate::error::{DownloadError, Result};

/// Proof of identity presented to the proxy on a single `CONNECT`.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    Basic { user: String, pass: String },
    /// `token` is the base64 SPNEGO initial context token.
    Negotiate { token: String, expires_at: SystemTime },
}

impl Credential {
    /// Value for the `Proxy-Authorization` header, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Credential::None => None,
            Credential::Basic { user, pass } => {
                Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
            }
            Credential::Negotiate { token, .. } => Some(format!("Negotiate {token}")),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self {
            Credential::Negotiate { expires_at, .. } => *expires_at <= SystemTime::now(),
            _ => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("pass", &"<redacted>")
                .finish(),
            Credential::Negotiate { expires_at, .. } => f
                .debug_struct("Negotiate")
                .field("token", &"<redacted>")
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Produces fresh proxy credentials on demand. Nothing is cached here:
/// every SPNEGO acquisition asks the ticket source again.
pub struct CredentialProvider {
    auth: ProxyAuth,
    username: Option<String>,
    password: Option<String>,
    realm: Option<String>,
    krb5_config: Option<PathBuf>,
    tickets: Arc<dyn TicketSource>,
}

impl CredentialProvider {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let tickets: Arc<dyn TicketSource> = match config.auth {
            ProxyAuth::Spnego => Self::system_tickets(config)?,
            _ => Arc::new(UnavailableTicketSource),
        };
        Self::with_ticket_source(config, tickets)
    }

    pub fn with_ticket_source(config: &ProxyConfig, tickets: Arc<dyn TicketSource>) -> Result<Self> {
        config.validate()?;
        let realm = match config.auth {
            ProxyAuth::Spnego => Some(kerberos::resolve_realm(
                config.realm.as_deref(),
                config.krb5_config.as_deref(),
            )?),
            _ => None,
        };
        Ok(Self {
            auth: config.auth,
            username: config.username.clone(),
            password: config.password.clone(),
            realm,
            krb5_config: config.krb5_config.clone(),
            tickets,
        })
    }

    #[cfg(feature = "gssapi")]
    fn system_tickets(config: &ProxyConfig) -> Result<Arc<dyn TicketSource>> {
        let realm =
            kerberos::resolve_realm(config.realm.as_deref(), config.krb5_config.as_deref())?;
        let source = kerberos::GssapiTicketSource::new(
            config.username.as_deref(),
            config.password.as_deref(),
            &realm,
        )?;
        Ok(Arc::new(source))
    }

    #[cfg(not(feature = "gssapi"))]
    fn system_tickets(_config: &ProxyConfig) -> Result<Arc<dyn TicketSource>> {
        Ok(Arc::new(UnavailableTicketSource))
    }

    pub fn auth(&self) -> ProxyAuth {
        self.auth
    }

    /// SPN for `host`, which must be the proxy hostname as dialled.
    pub fn service_principal(&self, host: &str) -> Result<String> {
        if is_ip_literal(host) {
            return Err(DownloadError::Config(format!(
                "cannot build a Kerberos service principal for IP address {host}"
            )));
        }
        let realm = self.realm.as_deref().ok_or_else(|| {
            DownloadError::Config("no Kerberos realm configured for spnego".into())
        })?;
        Ok(kerberos::service_principal(host, realm))
    }

    pub async fn acquire(&self, host: &str) -> Result<Credential> {
        match self.auth {
            ProxyAuth::None => Ok(Credential::None),
            ProxyAuth::Basic => match (&self.username, &self.password) {
                (Some(user), Some(pass)) if !user.is_empty() => Ok(Credential::Basic {
                    user: user.clone(),
                    pass: pass.clone(),
                }),
                _ => Err(DownloadError::Config(
                    "basic proxy authentication needs a username and password".into(),
                )),
            },
            ProxyAuth::Spnego => {
                let spn = self.service_principal(host)?;
                debug!("requesting SPNEGO token for {spn}");
                let tickets = self.tickets.clone();
                let config = self.krb5_config.clone();
                let token = task::spawn_blocking(move || {
                    tickets.initial_context_token(&spn, config.as_deref())
                })
                .await
                .map_err(|err| DownloadError::Kerberos(format!("ticket task failed: {err}")))??;
                Ok(Credential::Negotiate {
                    token: STANDARD.encode(&token.bytes),
                    expires_at: token.expires_at,
                })
            }
        }
    }

    /// Discards cached Kerberos state before an authentication retry.
    pub async fn reset(&self) -> Result<()> {
        if self.auth != ProxyAuth::Spnego {
            return Ok(());
        }
        let tickets = self.tickets.clone();
        task::spawn_blocking(move || tickets.reset())
            .await
            .map_err(|err| DownloadError::Kerberos(format!("ticket task failed: {err}")))?
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}
