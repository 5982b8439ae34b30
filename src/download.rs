// ============================================
// download.rs - HTTP transport, streaming download, SHA-256 check
// ============================================
//
// How a download works:
// 1. Ask the server for the file (reqwest blocking client, redirects
//    followed - GitHub asset URLs always redirect to a CDN)
// 2. Read the body in 8KB chunks, write them to disk, report percent
// 3. Hash the finished file with SHA-256
// 4. If the release published a checksum, it MUST match. A mismatch
//    aborts the run before anything gets installed.
//    Without a published checksum we only log the local hash.
// ============================================

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DeployError, DeployResult};
use crate::release::ResolvedRelease;

/// Chunk size for downloads and hashing.
const CHUNK_SIZE: usize = 8192;

// ============================================
// TRANSPORT
// ============================================

/// Network access used by the release fetcher and the downloader.
pub trait Transport {
    /// GET a GitHub API URL and return the body.
    fn api_get(&self, url: &str) -> DeployResult<String>;

    /// GET a plain text file (checksum lists).
    fn get_text(&self, url: &str) -> DeployResult<String>;

    /// Stream `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u32)) -> DeployResult<u64>;
}

pub struct HttpTransport {
    api: reqwest::blocking::Client,
    files: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> DeployResult<Self> {
        let build = |timeout: u64| {
            reqwest::blocking::Client::builder()
                .user_agent(config.user_agent.clone())
                .redirect(reqwest::redirect::Policy::limited(10)) // Follow up to 10 redirects
                .timeout(Duration::from_secs(timeout))
                .build()
                .map_err(|e| DeployError::network("creating the HTTP client", e))
        };

        Ok(HttpTransport {
            api: build(config.http_timeout_secs)?,
            files: build(config.download_timeout_secs)?,
        })
    }

    fn get(
        client: &reqwest::blocking::Client,
        url: &str,
        accept: Option<&str>,
    ) -> DeployResult<reqwest::blocking::Response> {
        let mut request = client.get(url);
        if let Some(accept) = accept {
            request = request.header("Accept", accept);
        }

        let response = request
            .send()
            .map_err(|e| DeployError::network(format!("requesting {}", url), e))?;

        // 404 = no releases yet, 403 = rate limited, etc.
        if !response.status().is_success() {
            return Err(DeployError::network(
                format!("requesting {}", url),
                format!("server returned status {}", response.status()),
            ));
        }
        Ok(response)
    }
}

impl Transport for HttpTransport {
    fn api_get(&self, url: &str) -> DeployResult<String> {
        Self::get(&self.api, url, Some("application/vnd.github.v3+json"))?
            .text()
            .map_err(|e| DeployError::network(format!("reading {}", url), e))
    }

    fn get_text(&self, url: &str) -> DeployResult<String> {
        Self::get(&self.api, url, None)?
            .text()
            .map_err(|e| DeployError::network(format!("reading {}", url), e))
    }

    fn download(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u32)) -> DeployResult<u64> {
        let mut response = Self::get(&self.files, url, None)?;

        // May be 0 if the server doesn't report it
        let total_size = response.content_length().unwrap_or(0);

        let mut file = File::create(dest).map_err(|e| DeployError::fs("create", dest, e))?;
        let written = copy_with_progress(&mut response, &mut file, total_size, progress)
            .map_err(|e| DeployError::network(format!("downloading {}", url), e))?;

        // IMPORTANT: Explicitly flush and close the file before hashing it
        file.flush().map_err(|e| DeployError::fs("flush", dest, e))?;
        drop(file);

        Ok(written)
    }
}

/// Copy `reader` into `writer` in fixed-size chunks, calling `progress`
/// with 0-100 whenever the percentage changes. Without a known total
/// size only 0 and 100 are reported.
pub fn copy_with_progress<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    total_size: u64,
    progress: &mut dyn FnMut(u32),
) -> io::Result<u64> {
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut downloaded: u64 = 0;
    let mut last_percent = None;

    progress(0);
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..bytes_read])?;
        downloaded += bytes_read as u64;

        if total_size > 0 {
            let percent = ((downloaded * 100) / total_size).min(100) as u32;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                progress(percent);
            }
        }
    }

    if last_percent != Some(100) {
        progress(100);
    }
    Ok(downloaded)
}

// ============================================
// DOWNLOAD + VERIFY
// ============================================

/// Result of comparing the local hash with the published one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Published checksum matched
    Verified { sha256: String },
    /// Nothing to compare against - degraded trust, not a failure
    Unverified { computed: String },
}

/// Download `url` to `dest`, replacing any existing file.
pub fn download_file(
    transport: &dyn Transport,
    url: &str,
    dest: &Path,
    progress: &mut dyn FnMut(u32),
) -> DeployResult<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| DeployError::fs("create", parent, e))?;
    }
    if dest.exists() {
        fs::remove_file(dest).map_err(|e| DeployError::fs("remove old download", dest, e))?;
    }

    info!("Downloading {}", url);
    let bytes = transport.download(url, dest, progress)?;
    info!("Download complete: {} ({} bytes)", dest.display(), bytes);
    Ok(bytes)
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> DeployResult<String> {
    let mut file = File::open(path).map_err(|e| DeployError::fs("open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];

    loop {
        let n = file
            .read(&mut buffer)
            .map_err(|e| DeployError::fs("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare the file's hash with the published checksum, if any.
pub fn verify(path: &Path, expected: Option<&str>) -> DeployResult<Verification> {
    let actual = sha256_file(path)?;
    info!("Local SHA256: {}", actual);

    match expected {
        Some(expected) => {
            let expected = expected.trim().to_ascii_lowercase();
            if actual != expected {
                return Err(DeployError::Integrity {
                    file: path.to_path_buf(),
                    expected,
                    actual,
                });
            }
            info!("SHA256 verified successfully - checksums match");
            Ok(Verification::Verified { sha256: actual })
        }
        None => {
            warn!("No remote checksum available for comparison");
            warn!("Computed local SHA256: {}", actual);
            warn!("Please verify this checksum manually if security is critical");
            Ok(Verification::Unverified { computed: actual })
        }
    }
}

/// Download the release's installer into `dir` and verify it.
pub fn fetch_and_verify(
    transport: &dyn Transport,
    release: &ResolvedRelease,
    dir: &Path,
    progress: &mut dyn FnMut(u32),
) -> DeployResult<(PathBuf, Verification)> {
    let dest = dir.join(&release.asset.name);
    download_file(transport, &release.asset.browser_download_url, &dest, progress)?;
    let verification = verify(&dest, release.expected_sha256.as_deref())?;
    Ok((dest, verification))
}

// ============================================
// TESTS
// ============================================
