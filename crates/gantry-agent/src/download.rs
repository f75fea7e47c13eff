//! Artifact download and integrity checks.
//!
//! Artifacts are fetched relative to the server base URL. A companion
//! checksum file (`path=md5hex` per line) is fetched first when configured;
//! when it lists the artifact, the downloaded bytes must match.

use crate::error::DownloadError;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use reqwest::Client;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Plain HTTP GET of a resource body.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, DownloadError>;
}

pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, DownloadError> {
        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = res.bytes().await.map_err(|e| DownloadError::Request {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        debug!(url = %url, bytes = body.len(), "Fetched");
        Ok(body.to_vec())
    }
}

/// Parsed checksum file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumFile {
    entries: HashMap<String, String>,
}

impl ChecksumFile {
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(path, md5)| (normalize_key(path.trim()), md5.trim().to_ascii_lowercase()))
            .collect();
        Self { entries }
    }

    pub fn md5_for(&self, path: &str) -> Option<&str> {
        self.entries.get(&normalize_key(path)).map(String::as_str)
    }

    /// Check `bytes` against the entry for `path`. `Unverified` when unlisted.
    pub fn verify(&self, path: &str, bytes: &[u8]) -> Result<Integrity, DownloadError> {
        match self.md5_for(path) {
            Some(expected) if expected == md5_hex(bytes) => Ok(Integrity::Verified),
            Some(_) => Err(DownloadError::Integrity {
                path: path.to_string(),
            }),
            None => Ok(Integrity::Unverified),
        }
    }
}

fn normalize_key(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Verified,
    Unverified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactHandler {
    /// Save the body as a single file.
    File,
    /// Unpack a gzip'd tar into a directory.
    Dir,
}

/// One artifact to fetch and save.
#[derive(Debug, Clone)]
pub struct ArtifactDownload {
    pub url: String,
    pub dest: PathBuf,
    pub handler: ArtifactHandler,
    pub checksum_url: Option<String>,
    /// Key of the artifact in the checksum file.
    pub checksum_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub integrity: Integrity,
    /// The checksum file itself was not on the server.
    pub checksum_file_missing: bool,
}

pub struct ArtifactDownloader {
    fetcher: Arc<dyn HttpFetcher>,
    base_url: Url,
}

impl ArtifactDownloader {
    pub fn new(fetcher: Arc<dyn HttpFetcher>, base_url: Url) -> Self {
        Self { fetcher, base_url }
    }

    /// Resolve a possibly relative URL against the base URL.
    pub fn resolve(&self, url: &str) -> Result<Url, DownloadError> {
        self.base_url
            .join(url)
            .map_err(|_| DownloadError::InvalidUrl(url.to_string()))
    }

    pub async fn download(&self, download: &ArtifactDownload) -> Result<DownloadOutcome, DownloadError> {
        let (checksums, checksum_file_missing) = match &download.checksum_url {
            Some(url) => match self.fetch_checksums(url).await? {
                Some(file) => (Some(file), false),
                None => (None, true),
            },
            None => (None, false),
        };

        let url = self.resolve(&download.url)?;
        let body = self.fetcher.fetch(&url).await?;

        let dest = download.dest.clone();
        let key = download.checksum_path.clone();
        let handler = download.handler;
        let integrity = tokio::task::spawn_blocking(move || {
            let checksum = checksums.as_ref().zip(key.as_deref());
            match handler {
                ArtifactHandler::File => write_file(&body, &dest, checksum),
                ArtifactHandler::Dir => unpack_dir(&body, &dest, checksum),
            }
        })
        .await
        .map_err(|e| DownloadError::Io(std::io::Error::other(e)))??;

        Ok(DownloadOutcome {
            integrity,
            checksum_file_missing,
        })
    }

    async fn fetch_checksums(&self, url: &str) -> Result<Option<ChecksumFile>, DownloadError> {
        let url = self.resolve(url)?;
        match self.fetcher.fetch(&url).await {
            Ok(body) => Ok(Some(ChecksumFile::parse(&String::from_utf8_lossy(&body)))),
            Err(e) if e.is_not_found() => {
                warn!(url = %url, "Checksum file not found, artifacts will not be verified");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Write `bytes` to `dest`, verifying against `checksum` (file, key) first.
pub fn write_file(
    bytes: &[u8],
    dest: &Path,
    checksum: Option<(&ChecksumFile, &str)>,
) -> Result<Integrity, DownloadError> {
    let integrity = match checksum {
        Some((file, key)) => file.verify(key, bytes)?,
        None => Integrity::Unverified,
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, bytes)?;
    Ok(integrity)
}

/// Unpack a gzip'd tar into `dest`.
///
/// Each file entry is checked against `<key>/<entry path>`; the result is
/// `Verified` only when every file was listed.
pub fn unpack_dir(
    bytes: &[u8],
    dest: &Path,
    checksum: Option<(&ChecksumFile, &str)>,
) -> Result<Integrity, DownloadError> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut all_verified = checksum.is_some();

    let entries = archive
        .entries()
        .map_err(|e| DownloadError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DownloadError::Archive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| DownloadError::Archive(e.to_string()))?
            .into_owned();
        let relative = sanitize(&path)?;
        let target = dest.join(&relative);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if !kind.is_file() {
            continue;
        }

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;

        if let Some((file, key)) = checksum {
            let entry_key = format!("{}/{}", key.trim_end_matches('/'), relative.to_string_lossy());
            if file.verify(&entry_key, &contents)? == Integrity::Unverified {
                all_verified = false;
            }
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &contents)?;
    }

    Ok(if all_verified {
        Integrity::Verified
    } else {
        Integrity::Unverified
    })
}

fn sanitize(path: &Path) -> Result<PathBuf, DownloadError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(DownloadError::Archive(format!(
                    "entry '{}' escapes the destination",
                    path.display()
                )));
            }
        }
    }
    Ok(clean)
}
