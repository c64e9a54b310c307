use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::error::{DownloadError, Result};

pub const SIDECAR_FILE_NAME: &str = "download-file.json";

/// Record of what was downloaded, kept next to the artifact. Only written
/// once every file it names has been verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    pub product_path: String,
    pub product_slug: String,
    pub product_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell_version: Option<String>,
}

impl Sidecar {
    pub fn new(
        product_path: &Path,
        product_slug: &str,
        product_version: &str,
        digest: Option<&Checksum>,
        bytes: u64,
    ) -> Self {
        let (sha256, md5) = match digest {
            Some(Checksum::Sha256(_)) => (digest.map(Checksum::to_hex), None),
            Some(Checksum::Md5(_)) => (None, digest.map(Checksum::to_hex)),
            None => (None, None),
        };
        Self {
            product_path: product_path.display().to_string(),
            product_slug: product_slug.to_string(),
            product_version: product_version.to_string(),
            sha256,
            md5,
            bytes,
            stemcell_path: None,
            stemcell_version: None,
        }
    }

    pub fn with_stemcell(mut self, path: &Path, version: &str) -> Self {
        self.stemcell_path = Some(path.display().to_string());
        self.stemcell_version = Some(version.to_string());
        self
    }

    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(SIDECAR_FILE_NAME)
    }

    /// Writes to a temporary file in `output_dir`, then renames over the
    /// side-car so readers never see a partial document.
    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        let target = Self::path_in(output_dir);
        let temp = output_dir.join(format!(".{SIDECAR_FILE_NAME}.tmp"));
        info!("Writing a list of downloaded artifact to {SIDECAR_FILE_NAME}");

        let mut document = serde_json::to_vec_pretty(self)
            .map_err(|err| DownloadError::Config(format!("cannot encode side-car: {err}")))?;
        document.push(b'\n');

        let written = fs::File::create(&temp).and_then(|mut file| {
            file.write_all(&document)?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|()| fs::rename(&temp, &target)) {
            let _ = fs::remove_file(&temp);
            return Err(DownloadError::io(&target, err));
        }
        Ok(target)
    }

    pub fn read(output_dir: &Path) -> Result<Self> {
        let path = Self::path_in(output_dir);
        let raw = fs::read(&path).map_err(|err| DownloadError::io(&path, err))?;
        serde_json::from_slice(&raw).map_err(|err| {
            DownloadError::io(&path, io::Error::new(io::ErrorKind::InvalidData, err))
        })
    }
}
