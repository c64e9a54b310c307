//! Boundary to the host's Kerberos library.
//!
//! Ticket mechanics live entirely in GSSAPI; this module only finds the
//! client configuration, works out the default realm, and asks the library
//! for an SPNEGO initial context token bound to one service principal.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{DownloadError, Result};

/// Lifetime assumed for a context token when the library does not report one.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

const CONFIG_SEARCH_PATH: &[&str] = &[
    "/etc/krb5.conf",
    "/usr/local/etc/krb5.conf",
    "/opt/homebrew/etc/krb5.conf",
];

/// Opaque SPNEGO initial token, valid for a single SPN.
#[derive(Clone)]
pub struct ContextToken {
    pub bytes: Vec<u8>,
    pub expires_at: SystemTime,
}

impl std::fmt::Debug for ContextToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextToken")
            .field("len", &self.bytes.len())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of Kerberos service tickets.
///
/// Calls may block on a KDC round trip and are always made from
/// `spawn_blocking`.
pub trait TicketSource: Send + Sync {
    fn initial_context_token(&self, spn: &str, config_path: Option<&Path>) -> Result<ContextToken>;

    /// Drops any cached Kerberos state so the next token comes from a fresh
    /// login.
    fn reset(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves the Kerberos client configuration: an explicit path wins, then
/// `KRB5_CONFIG`, then the usual install locations.
pub fn locate_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env::var_os("KRB5_CONFIG") {
        // KRB5_CONFIG may hold a colon separated list
        let found = env::split_paths(&value).find(|candidate| candidate.is_file());
        if found.is_some() {
            return found;
        }
    }
    CONFIG_SEARCH_PATH
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
}

/// Reads `default_realm` from the `[libdefaults]` section of a krb5.conf.
pub fn default_realm(config: &str) -> Option<String> {
    let mut in_libdefaults = false;
    for raw in config.lines() {
        let line = raw.split(['#', ';']).next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            in_libdefaults = line.trim_matches(|c| c == '[' || c == ']').trim() == "libdefaults";
            continue;
        }
        if !in_libdefaults {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "default_realm" {
                let realm = value.trim();
                if !realm.is_empty() {
                    return Some(realm.to_string());
                }
            }
        }
    }
    None
}

/// Realm for the proxy's SPN: the configured one, else the config default.
pub fn resolve_realm(explicit: Option<&str>, config_path: Option<&Path>) -> Result<String> {
    if let Some(realm) = explicit.map(str::trim).filter(|realm| !realm.is_empty()) {
        return Ok(realm.to_string());
    }
    let path = locate_config(config_path).ok_or_else(|| {
        DownloadError::Config(
            "no Kerberos realm configured and no krb5.conf found; pass --proxy-realm or --proxy-krb5-config"
                .into(),
        )
    })?;
    let contents = fs::read_to_string(&path).map_err(|err| DownloadError::io(&path, err))?;
    default_realm(&contents).ok_or_else(|| {
        DownloadError::Config(format!(
            "{} does not define default_realm; pass --proxy-realm",
            path.display()
        ))
    })
}

pub fn service_principal(host: &str, realm: &str) -> String {
    format!("HTTP/{host}@{realm}")
}

/// Credential cache private to this process, used for password logins.
pub fn login_cache_path() -> PathBuf {
    env::temp_dir().join(format!("krb5cc_pivnet_fetch_{}", std::process::id()))
}

/// Variables the Kerberos library reads: the client configuration and, for
/// password logins, the private credential cache.
pub fn environment(config_path: Option<&Path>, login_cache: Option<&Path>) -> Vec<(&'static str, OsString)> {
    let mut vars = Vec::new();
    if let Some(path) = config_path {
        vars.push(("KRB5_CONFIG", path.as_os_str().to_owned()));
    }
    if let Some(cache) = login_cache {
        let mut value = OsString::from("FILE:");
        value.push(cache);
        vars.push(("KRB5CCNAME", value));
    }
    vars
}

/// Stand-in used when the crate is built without the `gssapi` feature.
#[derive(Debug, Default)]
pub struct UnavailableTicketSource;

impl TicketSource for UnavailableTicketSource {
    fn initial_context_token(&self, _spn: &str, _config_path: Option<&Path>) -> Result<ContextToken> {
        Err(DownloadError::Kerberos("built without GSSAPI support".into()))
    }
}

#[cfg(feature = "gssapi")]
pub use gssapi::GssapiTicketSource;

#[cfg(feature = "gssapi")]
mod gssapi {
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::process::{Command, Stdio};
    use std::time::SystemTime;

    use libgssapi::context::{ClientCtx, CtxFlags, SecurityContext};
    use libgssapi::name::Name;
    use libgssapi::oid::{GSS_MECH_SPNEGO, GSS_NT_KRB5_PRINCIPAL};
    use log::debug;

    use super::{environment, login_cache_path, ContextToken, TicketSource, DEFAULT_TOKEN_LIFETIME};
    use crate::error::{DownloadError, Result};

    struct PasswordLogin {
        principal: String,
        password: String,
        cache: PathBuf,
    }

    /// Ticket source backed by the host GSSAPI library.
    pub struct GssapiTicketSource {
        login: Option<PasswordLogin>,
    }

    impl GssapiTicketSource {
        /// With a password, logs in to the credential cache private to this
        /// process. The environment pointing the library at that cache is
        /// exported by the caller before any thread starts.
        pub fn new(
            username: Option<&str>,
            password: Option<&str>,
            realm: &str,
        ) -> Result<Self> {
            let login = match (username, password) {
                (Some(user), Some(pass)) if !user.is_empty() => {
                    let cache = login_cache_path();
                    let expected = environment(None, Some(&cache));
                    if expected.iter().any(|(name, value)| std::env::var_os(name).as_ref() != Some(value)) {
                        return Err(DownloadError::Config(
                            "the Kerberos credential cache was not exported before start-up".into(),
                        ));
                    }
                    let principal = if user.contains('@') {
                        user.to_string()
                    } else {
                        format!("{user}@{realm}")
                    };
                    Some(PasswordLogin {
                        principal,
                        password: pass.to_string(),
                        cache,
                    })
                }
                _ => None,
            };
            let source = Self { login };
            source.kinit()?;
            Ok(source)
        }

        fn kinit(&self) -> Result<()> {
            let Some(login) = &self.login else {
                return Ok(());
            };
            debug!("obtaining a Kerberos TGT into {}", login.cache.display());
            let mut child = Command::new("kinit")
                .arg("-c")
                .arg(&login.cache)
                .arg(&login.principal)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| DownloadError::Kerberos(format!("failed to run kinit: {err}")))?;
            if let Some(mut stdin) = child.stdin.take() {
                writeln!(stdin, "{}", login.password)
                    .map_err(|err| DownloadError::Kerberos(format!("kinit stdin: {err}")))?;
            }
            let output = child
                .wait_with_output()
                .map_err(|err| DownloadError::Kerberos(format!("kinit failed: {err}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(DownloadError::Kerberos(format!(
                    "kinit for {} failed: {}",
                    login.principal,
                    stderr.trim()
                )));
            }
            Ok(())
        }
    }

    impl TicketSource for GssapiTicketSource {
        fn initial_context_token(&self, spn: &str, _config_path: Option<&Path>) -> Result<ContextToken> {
            let name = Name::new(spn.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))
                .map_err(|err| DownloadError::Kerberos(format!("invalid service principal {spn}: {err}")))?;
            let mut ctx = ClientCtx::new(
                None,
                name,
                CtxFlags::GSS_C_MUTUAL_FLAG | CtxFlags::GSS_C_SEQUENCE_FLAG,
                Some(&GSS_MECH_SPNEGO),
            );
            let token = ctx
                .step(None, None)
                .map_err(|err| DownloadError::Kerberos(format!("no service ticket for {spn}: {err}")))?
                .ok_or_else(|| DownloadError::Kerberos(format!("empty SPNEGO token for {spn}")))?;
            let lifetime = ctx.lifetime().unwrap_or(DEFAULT_TOKEN_LIFETIME);
            Ok(ContextToken {
                bytes: token.to_vec(),
                expires_at: SystemTime::now() + lifetime,
            })
        }

        fn reset(&self) -> Result<()> {
            self.kinit()
        }
    }

    impl Drop for GssapiTicketSource {
        fn drop(&mut self) {
            if let Some(login) = &self.login {
                let _ = std::fs::remove_file(&login.cache);
            }
        }
    }
}
