use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use hex::FromHex;
use md5::Md5;
use sha2::digest::Digest;
use sha2::Sha256;
use tokio::task;

use crate::error::{DownloadError, Result};

/// Digest advertised by the artifact service for a product file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha256([u8; 32]),
    Md5([u8; 16]),
}

impl Checksum {
    pub fn sha256_hex(input: &str) -> Result<Self> {
        let bytes = <[u8; 32]>::from_hex(input.trim())
            .map_err(|_| DownloadError::Integrity(format!("invalid sha256 digest: {input}")))?;
        Ok(Checksum::Sha256(bytes))
    }

    pub fn md5_hex(input: &str) -> Result<Self> {
        let bytes = <[u8; 16]>::from_hex(input.trim())
            .map_err(|_| DownloadError::Integrity(format!("invalid md5 digest: {input}")))?;
        Ok(Checksum::Md5(bytes))
    }

    /// Prefers sha256 when both are published; empty strings count as absent.
    pub fn from_published(sha256: Option<&str>, md5: Option<&str>) -> Option<Self> {
        if let Some(value) = present(sha256) {
            if let Ok(checksum) = Self::sha256_hex(value) {
                return Some(checksum);
            }
        }
        present(md5).and_then(|value| Self::md5_hex(value).ok())
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Checksum::Sha256(_) => "sha256",
            Checksum::Md5(_) => "md5",
        }
    }

    pub fn to_hex(&self) -> String {
        match self {
            Checksum::Sha256(bytes) => hex::encode(bytes),
            Checksum::Md5(bytes) => hex::encode(bytes),
        }
    }

    pub async fn verify_file(&self, path: &Path) -> Result<()> {
        let path_owned = path.to_owned();
        let algorithm = self.clone();
        let computed = task::spawn_blocking(move || match algorithm {
            Checksum::Sha256(_) => hash_file::<Sha256>(&path_owned),
            Checksum::Md5(_) => hash_file::<Md5>(&path_owned),
        })
        .await
        .map_err(|err| DownloadError::Integrity(format!("digest task failed: {err}")))??;

        let expected: &[u8] = match self {
            Checksum::Sha256(bytes) => bytes,
            Checksum::Md5(bytes) => bytes,
        };
        if computed == expected {
            Ok(())
        } else {
            Err(DownloadError::Integrity(format!(
                "{} mismatch: expected {}, got {}",
                self.algorithm(),
                hex::encode(expected),
                hex::encode(computed)
            )))
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.to_hex())
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn hash_file<D: Digest>(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| DownloadError::io(path, err))?;
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| DownloadError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_vec())
}
