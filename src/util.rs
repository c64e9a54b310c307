use std::fs;
use std::path::Path;

use url::Url;

use crate::error::{DownloadError, Result};

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = value as f64;
    let mut unit = 0usize;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, UNITS[unit])
    } else {
        format!("{val:.2} {}", UNITS[unit])
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.as_os_str().is_empty() && !path.exists() {
        fs::create_dir_all(path).map_err(|err| DownloadError::io(path, err))?;
    }
    Ok(())
}

/// Replaces everything after `?` with `?...` so signed query strings never
/// reach logs or error messages.
pub fn redact_url(raw: &str) -> String {
    match raw.split_once('?') {
        Some((base, _)) => format!("{base}?..."),
        None => raw.to_string(),
    }
}

/// Last path segment of an object key such as `product-files/foo/bar.zip`.
pub fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(key)
}

/// `scheme://host:port` identity used to decide whether a connection can be
/// reused for another URL.
pub fn origin_of(url: &Url) -> String {
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

/// Host and port of `url` in the `authority` form used by `CONNECT`.
pub fn authority_of(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| DownloadError::Config(format!("URL has no host: {}", redact_url(url.as_str()))))?;
    let port = url.port_or_known_default().ok_or_else(|| {
        DownloadError::Config(format!("URL has no port: {}", redact_url(url.as_str())))
    })?;
    Ok(format!("{host}:{port}"))
}
