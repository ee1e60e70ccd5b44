//! Release discovery and base artifact download.
//!
//! Alpine publishes `latest-releases.yaml` next to its release artifacts:
//! a list of records, one per flavor. The builder picks the
//! `alpine-minirootfs` record, downloads the named tarball from the same
//! directory, verifies its checksum when the record carries one, and unpacks
//! it into the root.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::Archive;

use crate::error::{BuildError, Result};

/// Flavor tag of the minimal root filesystem record.
pub const MINIROOTFS_FLAVOR: &str = "alpine-minirootfs";

/// Name of the release index inside a release directory.
pub const RELEASE_INDEX: &str = "latest-releases.yaml";

/// One entry of the release index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseRecord {
    pub flavor: String,
    pub file: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Pick the minimal root filesystem record out of a release index.
pub fn select_minirootfs(records: &[ReleaseRecord]) -> Option<&ReleaseRecord> {
    records.iter().find(|r| r.flavor == MINIROOTFS_FLAVOR)
}

/// HTTP client bound to one release directory.
pub struct ReleaseClient {
    client: Client,
    base_url: String,
}

impl ReleaseClient {
    /// `base_url` is the release directory, e.g.
    /// `https://dl-cdn.alpinelinux.org/alpine/latest-stable/releases/x86_64`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // Downloads block to completion: no request timeout.
        let client = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| BuildError::Download(format!("creating HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn index_url(&self) -> String {
        format!("{}/{}", self.base_url, RELEASE_INDEX)
    }

    pub fn artifact_url(&self, record: &ReleaseRecord) -> String {
        format!("{}/{}", self.base_url, record.file)
    }

    /// Fetch the release index and return the minirootfs record.
    pub fn discover(&self) -> Result<ReleaseRecord> {
        let url = self.index_url();
        tracing::info!(%url, "fetching release index");

        let body = self
            .client
            .get(&url)
            .header(USER_AGENT, "alpiso")
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| BuildError::Discovery(format!("{}: {}", url, e)))?;

        let records: Vec<ReleaseRecord> = serde_yaml::from_str(&body)
            .map_err(|e| BuildError::Discovery(format!("parsing {}: {}", url, e)))?;

        select_minirootfs(&records).cloned().ok_or_else(|| {
            BuildError::Discovery(format!(
                "no {:?} record in {} ({} record(s) listed)",
                MINIROOTFS_FLAVOR,
                url,
                records.len()
            ))
        })
    }

    /// Download the artifact named by `record` to `dest`.
    pub fn download(&self, record: &ReleaseRecord, dest: &Path) -> Result<()> {
        let url = self.artifact_url(record);
        tracing::info!(%url, dest = %dest.display(), "downloading");

        let mut response = self
            .client
            .get(&url)
            .header(USER_AGENT, "alpiso")
            .send()
            .map_err(|e| BuildError::Download(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BuildError::Download(format!("{}: HTTP {}", url, status)));
        }

        let mut file = File::create(dest)
            .map_err(|e| BuildError::Download(format!("creating {}: {}", dest.display(), e)))?;
        response
            .copy_to(&mut file)
            .map_err(|e| BuildError::Download(format!("{}: {}", url, e)))?;
        drop(file);

        if let Some(expected) = &record.sha256 {
            verify_sha256(dest, expected)?;
        }
        Ok(())
    }
}

/// Compare a file's SHA-256 against a lowercase or uppercase hex digest.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(BuildError::Download(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected.trim(),
            actual
        )))
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Unpack a gzip-compressed tarball into `dest`, keeping permissions.
///
/// Ownership is only restored when running as root; otherwise files belong
/// to the invoking user.
pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(tarball)
        .map_err(|e| BuildError::Extract(format!("opening {}: {}", tarball.display(), e)))?;

    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(nix::unistd::Uid::effective().is_root());
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    archive
        .unpack(dest)
        .map_err(|e| BuildError::Extract(format!("{}: {}", tarball.display(), e)))
}
