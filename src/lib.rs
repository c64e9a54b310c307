//! Authenticated artifact downloads from the Pivotal Network.
//!
//! A [`download::Downloader`] resolves an [`pivnet::ArtifactHandle`] to a
//! pre-signed link, then fetches it in parallel byte ranges over
//! connections that may be tunnelled through a Basic or SPNEGO proxy.

pub mod checksum;
pub mod cli;
pub mod download;
pub mod error;
pub mod pivnet;
pub mod progress;
pub mod proxy;
pub mod scheduler;
pub mod sidecar;
pub mod transport;
pub mod util;

pub use error::{DownloadError, ErrorKind, Result};
