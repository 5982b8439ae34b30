// ============================================
// release.rs - Find the latest Veyon release on GitHub
// ============================================
//
// How it works:
// 1. Call the GitHub API for the latest release of veyon/veyon
// 2. Pick the installer asset for our platform ("win64" in the name or URL)
// 3. Look for a checksum asset (SHA256SUMS, ...). If there is one,
//    download it and find the line with a 64-char hex hash next to our
//    filename. No filename match -> first hash in the file.
// 4. Still nothing? Try the same scan on the release notes.
//
// No download of the installer happens here. If no platform asset
// exists we stop before touching anything else.
// ============================================

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::download::Transport;
use crate::error::{DeployError, DeployResult};

// ============================================
// DATA STRUCTURES
// ============================================

/// Information about a GitHub release.
/// We only include the fields we care about, serde ignores the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    /// The release tag, e.g. "v4.9.1"
    pub tag_name: String,

    /// Release notes (markdown). Sometimes contains the checksums.
    #[serde(default)]
    pub body: Option<String>,

    /// List of downloadable files attached to this release.
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// A single downloadable file in a GitHub release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitHubAsset {
    /// The filename, e.g. "veyon-4.9.1.0-win64-setup.exe"
    pub name: String,

    /// The direct download URL for this file.
    pub browser_download_url: String,

    /// File size in bytes
    #[serde(default)]
    pub size: u64,
}

/// The release we are going to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub tag: String,
    pub asset: GitHubAsset,
    /// Lowercase hex SHA-256, if the release published one
    pub expected_sha256: Option<String>,
}

// ============================================
// FETCH
// ============================================

/// Query GitHub and resolve the installer asset and its checksum.
pub fn fetch_release(transport: &dyn Transport, config: &Config) -> DeployResult<ResolvedRelease> {
    debug!("Querying GitHub API: {}", config.release_api_url);
    let body = transport.api_get(&config.release_api_url)?;
    let release = parse_release(&body)?;
    info!("Latest release: {}", release.tag_name);

    resolve(transport, config, &release)
}

pub fn parse_release(body: &str) -> DeployResult<GitHubRelease> {
    serde_json::from_str(body)
        .map_err(|e| DeployError::network("parsing the release info", e))
}

/// Pick assets and checksum for an already parsed release.
pub fn resolve(
    transport: &dyn Transport,
    config: &Config,
    release: &GitHubRelease,
) -> DeployResult<ResolvedRelease> {
    let asset = select_platform_asset(&release.assets, &config.platform_token)
        .ok_or_else(|| DeployError::AssetNotFound {
            tag: release.tag_name.clone(),
            token: config.platform_token.clone(),
        })?
        .clone();
    info!("Found asset: {} ({} bytes)", asset.name, asset.size);

    let mut expected_sha256 = None;

    if let Some(checksum_asset) =
        select_checksum_asset(&release.assets, &asset, &config.checksum_keywords)
    {
        debug!("Found checksum asset: {}", checksum_asset.name);
        let text = transport.get_text(&checksum_asset.browser_download_url)?;
        expected_sha256 = find_checksum_in_text(&text, &asset.name);
        if expected_sha256.is_some() {
            info!("Found matching checksum for {}", asset.name);
        }
    }

    if expected_sha256.is_none() {
        if let Some(body) = release.body.as_deref().filter(|b| !b.trim().is_empty()) {
            debug!("Attempting to parse release body for checksum");
            expected_sha256 = find_checksum_in_text(body, &asset.name);
            if expected_sha256.is_some() {
                info!("Found checksum in release body");
            }
        }
    }

    match &expected_sha256 {
        Some(sum) => info!("Remote SHA256: {}", sum),
        None => warn!("No remote checksum found - will compute local SHA256 only"),
    }

    Ok(ResolvedRelease {
        tag: release.tag_name.clone(),
        asset,
        expected_sha256,
    })
}

// ============================================
// SELECTION HELPERS
// ============================================

/// First asset whose name or URL contains `token` (case-insensitive).
pub fn select_platform_asset<'a>(assets: &'a [GitHubAsset], token: &str) -> Option<&'a GitHubAsset> {
    let token = token.to_ascii_lowercase();
    assets.iter().find(|a| {
        a.name.to_ascii_lowercase().contains(&token)
            || a.browser_download_url.to_ascii_lowercase().contains(&token)
    })
}

/// First asset (other than the installer) whose name contains one of
/// the checksum keywords.
pub fn select_checksum_asset<'a>(
    assets: &'a [GitHubAsset],
    installer: &GitHubAsset,
    keywords: &[String],
) -> Option<&'a GitHubAsset> {
    assets.iter().filter(|a| *a != installer).find(|a| {
        let name = a.name.to_ascii_lowercase();
        keywords
            .iter()
            .any(|k| name.contains(&k.to_ascii_lowercase()))
    })
}

fn sha256_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b([A-Fa-f0-9]{64})\b").expect("checksum pattern is a valid regex")
    })
}

/// Extract a SHA-256 checksum from a checksum list or release notes.
///
/// A line that contains both a hash and `filename` wins. Otherwise the
/// first hash found anywhere is returned. Always lowercase.
pub fn find_checksum_in_text(text: &str, filename: &str) -> Option<String> {
    let mut fallback = None;

    for line in text.lines() {
        let Some(found) = sha256_pattern().captures(line) else {
            continue;
        };
        let hash = found[1].to_ascii_lowercase();
        if line.contains(filename) {
            return Some(hash);
        }
        if fallback.is_none() {
            fallback = Some(hash);
        }
    }

    fallback
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    const HASH_A: &str = "abcdef0123456789abcdef0123456789abcdef0123456789abcdef012345ef01";
    const HASH_B: &str = "1111111111111111111111111111111111111111111111111111111111111111";

    fn asset(name: &str) -> GitHubAsset {
        GitHubAsset {
            name: name.to_string(),
            browser_download_url: format!("https://x/{}", name),
            size: 0,
        }
    }

    #[test]
    fn scenario_win64_with_sha256sums() {
        let release_json = r#"{
            "tag_name": "v4.9.1",
            "assets": [
                {"name": "veyon-4.9.1-win64.exe", "browser_download_url": "https://x/veyon-4.9.1-win64.exe"},
                {"name": "SHA256SUMS", "browser_download_url": "https://x/SHA256SUMS"}
            ]
        }"#;
        let sums = format!(
            "{}  veyon-4.9.1-win32.exe\n{}  veyon-4.9.1-win64.exe\n",
            HASH_B,
            HASH_A.to_ascii_uppercase()
        );
        let transport = FakeTransport::new()
            .with_api(release_json)
            .with_text("https://x/SHA256SUMS", &sums);

        let resolved = fetch_release(&transport, &Config::default()).unwrap();
        assert_eq!(resolved.tag, "v4.9.1");
        assert_eq!(resolved.asset.name, "veyon-4.9.1-win64.exe");
        assert_eq!(resolved.expected_sha256.as_deref(), Some(HASH_A));
        assert!(transport.downloads().is_empty());
    }

    #[test]
    fn no_platform_asset_fails_without_downloading() {
        let release_json = r#"{
            "tag_name": "v4.9.1",
            "assets": [
                {"name": "veyon-4.9.1-win32.exe", "browser_download_url": "https://x/veyon-4.9.1-win32.exe"},
                {"name": "SHA256SUMS", "browser_download_url": "https://x/SHA256SUMS"}
            ]
        }"#;
        let transport = FakeTransport::new().with_api(release_json);

        let err = fetch_release(&transport, &Config::default()).unwrap_err();
        assert!(matches!(err, DeployError::AssetNotFound { ref tag, .. } if tag == "v4.9.1"));
        assert!(transport.downloads().is_empty());
        assert!(transport.text_requests().is_empty());
    }

    #[test]
    fn empty_asset_list_is_asset_not_found() {
        let transport = FakeTransport::new().with_api(r#"{"tag_name": "v4.9.1"}"#);
        assert!(matches!(
            fetch_release(&transport, &Config::default()),
            Err(DeployError::AssetNotFound { .. })
        ));
    }

    #[test]
    fn platform_token_matches_url_too() {
        let assets = vec![GitHubAsset {
            name: "veyon-setup.exe".to_string(),
            browser_download_url: "https://x/WIN64/veyon-setup.exe".to_string(),
            size: 0,
        }];
        assert!(select_platform_asset(&assets, "win64").is_some());
    }

    #[test]
    fn checksum_asset_never_selects_the_installer() {
        let installer = asset("veyon-sha256-win64.exe");
        let assets = vec![installer.clone(), asset("checksums.txt")];
        let keywords = Config::default().checksum_keywords;
        let picked = select_checksum_asset(&assets, &installer, &keywords).unwrap();
        assert_eq!(picked.name, "checksums.txt");
    }

    #[test]
    fn checksum_falls_back_to_first_hash() {
        let text = format!("{}  something-else.exe\n{}  other.exe\n", HASH_B, HASH_A);
        assert_eq!(
            find_checksum_in_text(&text, "veyon-4.9.1-win64.exe").as_deref(),
            Some(HASH_B)
        );
    }

    #[test]
    fn longer_hex_runs_are_not_checksums() {
        let text = format!("{}ff  veyon-4.9.1-win64.exe\n", HASH_A);
        assert_eq!(find_checksum_in_text(&text, "veyon-4.9.1-win64.exe"), None);
    }

    #[test]
    fn release_body_is_used_when_no_checksum_asset() {
        let release = GitHubRelease {
            tag_name: "v4.9.1".to_string(),
            body: Some(format!("## Checksums\n\n`veyon-4.9.1-win64.exe`: {}\n", HASH_A)),
            assets: vec![asset("veyon-4.9.1-win64.exe")],
        };
        let transport = FakeTransport::new();
        let resolved = resolve(&transport, &Config::default(), &release).unwrap();
        assert_eq!(resolved.expected_sha256.as_deref(), Some(HASH_A));
    }

    #[test]
    fn failing_checksum_download_is_a_network_error() {
        let release = GitHubRelease {
            tag_name: "v4.9.1".to_string(),
            body: None,
            assets: vec![asset("veyon-4.9.1-win64.exe"), asset("SHA256SUMS")],
        };
        let transport = FakeTransport::new();
        assert!(matches!(
            resolve(&transport, &Config::default(), &release),
            Err(DeployError::Network { .. })
        ));
    }
}
