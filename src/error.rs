// ============================================
// error.rs - Everything that can go wrong during a run
// ============================================
//
// Every step returns DeployResult<T>. The variants line up with how the
// workflows react to them:
//
//   Network / AssetNotFound / Integrity  -> abort the whole run
//   ElevationDenied                      -> installer aborts the run,
//                                           key distribution is a partial success
//   KeyGeneration                        -> fatal to the teacher install
//   MissingKeys                          -> operator has to copy the keys folder
//   PermissionDenied                     -> triggers the elevated retry path
//
// remediation() gives the operator the next manual step. It is printed
// by workflow::run and written to the log file.
// ============================================

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shorthand used by every step.
pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("network error while {action}: {message}")]
    Network { action: String, message: String },

    #[error("release {tag} has no asset matching '{token}'")]
    AssetNotFound { tag: String, token: String },

    #[error(
        "SHA256 verification failed for {}: expected {expected}, got {actual}",
        file.display()
    )]
    Integrity {
        file: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("elevation denied while {action}: {reason}")]
    ElevationDenied { action: String, reason: String },

    #[error("key pair '{key}' generation failed after {attempts} attempt(s): {reason}")]
    KeyGeneration {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("required key file not found: {}", expected.display())]
    MissingKeys {
        expected: PathBuf,
        remediation: String,
    },

    #[error("permission denied while trying to {action} {}: {source}", path.display())]
    PermissionDenied {
        action: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to {action} {}: {source}", path.display())]
    Filesystem {
        action: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{program}: {message}")]
    Process { program: String, message: String },

    #[error("invalid configuration in {}: {message}", path.display())]
    Config { path: PathBuf, message: String },
}

impl DeployError {
    /// Wrap an io::Error from a filesystem call.
    ///
    /// Access-denied errors become `PermissionDenied` so the elevation
    /// fallback can match on them; everything else is `Filesystem`.
    pub fn fs(action: &str, path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            DeployError::PermissionDenied {
                action: action.to_string(),
                path: path.to_path_buf(),
                source,
            }
        } else {
            DeployError::Filesystem {
                action: action.to_string(),
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn network(action: impl Into<String>, message: impl ToString) -> Self {
        DeployError::Network {
            action: action.into(),
            message: message.to_string(),
        }
    }

    pub fn process(program: impl Into<String>, message: impl Into<String>) -> Self {
        DeployError::Process {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, DeployError::PermissionDenied { .. })
    }

    /// The concrete next step for the operator, if there is one.
    pub fn remediation(&self) -> Option<String> {
        match self {
            DeployError::Network { .. } => Some(
                "Check the internet connection (and any proxy) of this machine, then re-run."
                    .to_string(),
            ),
            DeployError::AssetNotFound { .. } => Some(
                "Download the Windows 64-bit installer manually from \
                 https://github.com/veyon/veyon/releases and install it by hand."
                    .to_string(),
            ),
            DeployError::Integrity { .. } => Some(
                "Do NOT install this file. Delete the temp folder next to this program \
                 and re-run; if it keeps failing, report it to the Veyon project."
                    .to_string(),
            ),
            DeployError::ElevationDenied { .. } => Some(
                "Approve the UAC prompt, or right-click this program and choose \
                 'Run as administrator'."
                    .to_string(),
            ),
            DeployError::KeyGeneration { key, .. } => Some(format!(
                "Open Veyon Configurator > Authentication keys and create a key pair \
                 named '{}', then re-run the teacher install as administrator.",
                key
            )),
            DeployError::MissingKeys { remediation, .. } => Some(remediation.clone()),
            DeployError::PermissionDenied { path, .. } => Some(format!(
                "Run this program as administrator, or copy {} by hand.",
                path.display()
            )),
            DeployError::Filesystem { .. } | DeployError::Process { .. } => None,
            DeployError::Config { path, .. } => Some(format!(
                "Fix or delete {} (defaults are used when it is missing).",
                path.display()
            )),
        }
    }
}

// ============================================
// TESTS
// ============================================
