// ============================================
// config.rs - Settings and well-known locations
// ============================================
//
// PORTABLE DESIGN:
// The tool runs from a USB stick or network share. Everything it
// produces lives NEXT TO the EXE:
//
//   USB Drive/
//   ├── veyon-installer.exe
//   ├── veyon-installer.toml    # optional, every field has a default
//   ├── keys/                   # staged key pair (teacher -> students)
//   │   ├── private/supervisor/key
//   │   └── public/supervisor/key
//   ├── logs/                   # one log file per run
//   └── temp/                   # downloaded installers
//
// Veyon itself lives in OS-managed folders that we find through the
// usual environment variables (PROGRAMDATA, PROGRAMFILES, ...).
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};
use crate::retry::RetryPolicy;

/// Name of the optional config file next to the EXE.
pub const CONFIG_FILE_NAME: &str = "veyon-installer.toml";

// ============================================
// CONFIG FILE
// ============================================

/// Settings read from veyon-installer.toml.
/// Missing fields fall back to the defaults below, so an empty file
/// (or no file at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GitHub API endpoint for the latest Veyon release
    pub release_api_url: String,

    /// User-Agent sent with every request (GitHub rejects requests without one)
    pub user_agent: String,

    /// Substring that identifies the installer asset, e.g. "win64"
    pub platform_token: String,

    /// Substrings that identify a checksum asset (SHA256SUMS, checksums.txt, ...)
    pub checksum_keywords: Vec<String>,

    /// Name of the Veyon authentication key pair
    pub key_name: String,

    /// Folder name under ProgramData / Program Files
    pub vendor_dir_name: String,

    /// Vendor command line tool (inside the Program Files folder)
    pub cli_executable: String,

    /// Vendor uninstaller (inside the Program Files folder)
    pub uninstaller_executable: String,

    /// Windows service installed by Veyon
    pub service_name: String,

    /// Installer flags for the teacher (master) install
    pub teacher_install_args: Vec<String>,

    /// Installer flags for the student (service only) install
    pub student_install_args: Vec<String>,

    /// Uninstaller flags
    pub uninstall_args: Vec<String>,

    /// How long we wait for the uninstaller before giving up
    pub uninstall_timeout_secs: u64,

    /// How long we sleep when an elevated launch gives us no process handle
    pub fire_and_forget_wait_secs: u64,

    /// Pause after the uninstaller so it can finish removing files
    pub post_uninstall_settle_secs: u64,

    /// Timeout for GitHub API calls
    pub http_timeout_secs: u64,

    /// Timeout for the installer download
    pub download_timeout_secs: u64,

    /// Retry settings for key generation
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before each retry in milliseconds. The last entry repeats.
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            backoff_ms: vec![1000, 2000],
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.backoff_ms.iter().copied().map(Duration::from_millis).collect(),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            release_api_url: "https://api.github.com/repos/veyon/veyon/releases/latest"
                .to_string(),
            user_agent: format!("veyon-installer/{}", env!("CARGO_PKG_VERSION")),
            platform_token: "win64".to_string(),
            checksum_keywords: vec!["sha256".to_string(), "checksum".to_string()],
            key_name: "supervisor".to_string(),
            vendor_dir_name: "Veyon".to_string(),
            cli_executable: "veyon-cli.exe".to_string(),
            uninstaller_executable: "uninstall.exe".to_string(),
            service_name: "VeyonService".to_string(),
            teacher_install_args: vec!["/S".to_string()],
            student_install_args: vec!["/S".to_string(), "/Service".to_string()],
            uninstall_args: vec!["/S".to_string()],
            uninstall_timeout_secs: 120,
            fire_and_forget_wait_secs: 45,
            post_uninstall_settle_secs: 3,
            http_timeout_secs: 30,
            download_timeout_secs: 600,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load the config file, or the defaults if it doesn't exist.
    pub fn load(path: &Path) -> DeployResult<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content =
            fs::read_to_string(path).map_err(|e| DeployError::fs("read config", path, e))?;

        toml::from_str(&content).map_err(|e| DeployError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn uninstall_timeout(&self) -> Duration {
        Duration::from_secs(self.uninstall_timeout_secs)
    }

    pub fn fire_and_forget_wait(&self) -> Duration {
        Duration::from_secs(self.fire_and_forget_wait_secs)
    }
}

// ============================================
// PATHS
// ============================================

/// Every location a run touches, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Folder next to the EXE (keys/, logs/, temp/)
    pub root: PathBuf,

    /// %ProgramData%\Veyon - config and keys
    pub vendor_data_dir: PathBuf,

    /// Candidate install folders, in search order
    /// (%ProgramFiles%\Veyon, then %ProgramFiles(x86)%\Veyon)
    pub vendor_program_dirs: Vec<PathBuf>,

    /// Local disk folder for the staged installer.
    /// Elevated processes can't see network drive mappings, so the
    /// installer is copied here before it is launched.
    pub local_temp_dir: PathBuf,
}

impl Paths {
    /// Resolve the standard Windows locations from the environment.
    pub fn from_env(root: PathBuf, config: &Config) -> Paths {
        let program_data = env_dir("PROGRAMDATA", r"C:\ProgramData");
        let program_files = env_dir("PROGRAMFILES", r"C:\Program Files");
        let program_files_x86 = env_dir("PROGRAMFILES(X86)", r"C:\Program Files (x86)");

        let mut vendor_program_dirs = vec![program_files.join(&config.vendor_dir_name)];
        let x86 = program_files_x86.join(&config.vendor_dir_name);
        if !vendor_program_dirs.contains(&x86) {
            vendor_program_dirs.push(x86);
        }

        Paths {
            root,
            vendor_data_dir: program_data.join(&config.vendor_dir_name),
            vendor_program_dirs,
            local_temp_dir: std::env::temp_dir(),
        }
    }

    /// Where the teacher stages its key pair and students pick it up.
    pub fn staged_keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// %ProgramData%\Veyon\keys
    pub fn vendor_keys_dir(&self) -> PathBuf {
        self.vendor_data_dir.join("keys")
    }

    /// First existing `<vendor program dir>/<file_name>`.
    pub fn find_vendor_program(&self, file_name: &str) -> Option<PathBuf> {
        self.vendor_program_dirs
            .iter()
            .map(|dir| dir.join(file_name))
            .find(|path| path.is_file())
    }
}

fn env_dir(var: &str, fallback: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(fallback),
    }
}

/// Machine name used in the log file name.
pub fn host_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Get the directory where the EXE is located.
///
/// Uses std::env::current_exe() to find the EXE's actual location, so
/// keys and logs end up next to the EXE even when it is started from a
/// shortcut with a different working directory.
pub fn app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        // Canonicalize to resolve any symlinks/junctions, then get parent
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    // Last resort: use current directory (shouldn't normally happen)
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config.platform_token, "win64");
        assert_eq!(config.key_name, "supervisor");
        assert_eq!(config.student_install_args, vec!["/S", "/Service"]);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "key_name = \"classroom\"\nuninstall_timeout_secs = 30\n\n[retry]\nmax_attempts = 5\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.key_name, "classroom");
        assert_eq!(config.uninstall_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_ms, vec![1000, 2000]);
        assert_eq!(config.service_name, "VeyonService");
    }

    #[test]
    fn broken_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "key_name = [").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, DeployError::Config { .. }));
    }

    #[test]
    fn staged_layout_lives_under_root() {
        let paths = Paths {
            root: PathBuf::from("/usb"),
            vendor_data_dir: PathBuf::from("/programdata/Veyon"),
            vendor_program_dirs: vec![],
            local_temp_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(paths.staged_keys_dir(), PathBuf::from("/usb/keys"));
        assert_eq!(paths.logs_dir(), PathBuf::from("/usb/logs"));
        assert_eq!(paths.downloads_dir(), PathBuf::from("/usb/temp"));
        assert_eq!(
            paths.vendor_keys_dir(),
            PathBuf::from("/programdata/Veyon/keys")
        );
    }

    #[test]
    fn find_vendor_program_searches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("pf");
        let second = dir.path().join("pf86");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("uninstall.exe"), b"x").unwrap();

        let paths = Paths {
            root: dir.path().to_path_buf(),
            vendor_data_dir: dir.path().join("data"),
            vendor_program_dirs: vec![first.clone(), second.clone()],
            local_temp_dir: dir.path().to_path_buf(),
        };
        assert_eq!(
            paths.find_vendor_program("uninstall.exe"),
            Some(second.join("uninstall.exe"))
        );

        fs::write(first.join("uninstall.exe"), b"x").unwrap();
        assert_eq!(
            paths.find_vendor_program("uninstall.exe"),
            Some(first.join("uninstall.exe"))
        );
        assert_eq!(paths.find_vendor_program("veyon-cli.exe"), None);
    }
}
