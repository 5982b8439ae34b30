// ============================================
// keys.rs - Teacher side: create and stage the key pair
// ============================================
//
// Veyon authenticates the teacher ("master") against the students with
// an RSA key pair. Veyon keeps it under its data folder:
//
//   C:\ProgramData\Veyon\keys\
//   ├── private\supervisor\key     # stays on the teacher machine
//   └── public\supervisor\key      # goes to every student machine
//
// provision_keys() makes sure that pair exists (creating it with
// `veyon-cli authkeys create supervisor` if needed).
// stage_keys() copies it next to the EXE (keys\...) so the operator can
// carry the folder to the student machines.
//
// We never trust the CLI's exit code alone: a pair only counts when
// both files are on disk.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::Paths;
use crate::context::RunContext;
use crate::error::{DeployError, DeployResult};
use crate::fsops::{self, RobocopyMode};
use crate::process::{ProcessLauncher, ProcessOutcome, ProcessSpec, WaitPolicy};
use crate::retry::with_elevated_fallback;

// ============================================
// KEY LAYOUT
// ============================================

/// The two files of one key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairPaths {
    pub private: PathBuf,
    pub public: PathBuf,
}

impl KeyPairPaths {
    /// `<keys_root>/private/<name>/key` and `<keys_root>/public/<name>/key`
    pub fn under(keys_root: &Path, name: &str) -> Self {
        KeyPairPaths {
            private: keys_root.join("private").join(name).join("key"),
            public: keys_root.join("public").join(name).join("key"),
        }
    }

    pub fn both_exist(&self) -> bool {
        self.private.is_file() && self.public.is_file()
    }
}

/// Canonical pair under `keys_root`, if both files exist.
pub fn find_existing_pair(keys_root: &Path, name: &str) -> Option<KeyPairPaths> {
    let pair = KeyPairPaths::under(keys_root, name);
    pair.both_exist().then_some(pair)
}

/// Broader search used when the CLI says the pair exists but the
/// canonical files aren't there (different naming in another Veyon
/// version). Any file whose path mentions "private" / "public" counts.
pub fn scan_for_pair(keys_root: &Path) -> Option<KeyPairPaths> {
    let mut private = None;
    let mut public = None;

    for file in fsops::list_files(keys_root) {
        let relative = file
            .strip_prefix(keys_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .to_ascii_lowercase();
        if private.is_none() && relative.contains("private") {
            private = Some(file);
        } else if public.is_none() && relative.contains("public") {
            public = Some(file);
        }
    }

    Some(KeyPairPaths {
        private: private?,
        public: public?,
    })
}

// ============================================
// VENDOR CLI
// ============================================

/// What `authkeys create` told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliOutcome {
    Created,
    AlreadyExists,
    Failed { code: Option<i32>, output: String },
}

pub trait VendorCli {
    fn create_key_pair(&self, name: &str) -> DeployResult<CliOutcome>;
}

/// The real `veyon-cli.exe`.
///
/// It is looked up on every call: at startup Veyon usually isn't
/// installed yet. ProgramData\Veyon\keys is only writable by
/// administrators, so without admin rights the CLI goes through UAC.
pub struct VeyonCli<'a> {
    paths: Paths,
    file_name: String,
    elevate: bool,
    launcher: &'a dyn ProcessLauncher,
}

impl<'a> VeyonCli<'a> {
    pub fn new(ctx: &RunContext, launcher: &'a dyn ProcessLauncher) -> Self {
        VeyonCli {
            paths: ctx.paths.clone(),
            file_name: ctx.config.cli_executable.clone(),
            elevate: !ctx.privilege.is_elevated(),
            launcher,
        }
    }

    /// UAC launches give us no output, only an exit code. Whether the
    /// pair exists is decided by the files on disk afterwards.
    fn create_elevated(&self, executable: &Path, name: &str) -> DeployResult<CliOutcome> {
        let spec = ProcessSpec::new(executable)
            .args(["authkeys", "create", name])
            .elevated(true)
            .wait(WaitPolicy::Indefinite)
            .hidden();

        let outcome = match self.launcher.launch(&spec)? {
            ProcessOutcome::Exited(0) | ProcessOutcome::Detached => CliOutcome::Created,
            ProcessOutcome::Exited(code) => CliOutcome::Failed {
                code: Some(code),
                output: "no output from an elevated run".to_string(),
            },
            ProcessOutcome::TimedOut => CliOutcome::Failed {
                code: None,
                output: "did not finish".to_string(),
            },
        };
        Ok(outcome)
    }
}

impl VendorCli for VeyonCli<'_> {
    fn create_key_pair(&self, name: &str) -> DeployResult<CliOutcome> {
        let Some(executable) = self.paths.find_vendor_program(&self.file_name) else {
            return Err(DeployError::process(
                self.file_name.clone(),
                "not found in the Veyon program folder - is Veyon installed?",
            ));
        };
        debug!("Found Veyon CLI at: {}", executable.display());

        if self.elevate {
            return self.create_elevated(&executable, name);
        }

        info!("Running: {} authkeys create {}", executable.display(), name);
        let output = Command::new(&executable)
            .args(["authkeys", "create", name])
            .output()
            .map_err(|e| {
                DeployError::process(executable.display().to_string(), format!("failed to start: {}", e))
            })?;

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        debug!("veyon-cli output: {}", text.trim());

        Ok(classify_cli_output(output.status.code(), &text))
    }
}

/// Map exit code + output of `authkeys create` to an outcome.
/// "already exists" wins over the exit code; Veyon exits non-zero
/// for it on some versions.
pub fn classify_cli_output(code: Option<i32>, output: &str) -> CliOutcome {
    if output.to_ascii_lowercase().contains("already exists") {
        CliOutcome::AlreadyExists
    } else if code == Some(0) {
        CliOutcome::Created
    } else {
        CliOutcome::Failed {
            code,
            output: output.trim().to_string(),
        }
    }
}

// ============================================
// PROVISIONING
// ============================================

/// Where the pair we ended up with came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Both files were already there, the CLI was not called
    Existing,
    /// Created by the CLI and confirmed on disk
    Created,
    /// CLI said "already exists", found by the broader scan
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedKeys {
    pub paths: KeyPairPaths,
    pub source: KeySource,
}

/// Make sure the vendor key pair exists on this machine.
pub fn provision_keys(ctx: &RunContext, cli: &dyn VendorCli) -> DeployResult<ProvisionedKeys> {
    let keys_root = ctx.paths.vendor_keys_dir();
    let name = ctx.config.key_name.as_str();

    if let Some(paths) = find_existing_pair(&keys_root, name) {
        info!("Key pair '{}' already exists at {}", name, keys_root.display());
        return Ok(ProvisionedKeys {
            paths,
            source: KeySource::Existing,
        });
    }

    let policy = ctx.config.retry.policy();
    let max_attempts = policy.max_attempts();
    let mut last_attempt = 1;

    let result = policy.run(
        "Key pair creation",
        |attempt| {
            last_attempt = attempt;
            info!("Creating key pair '{}' (attempt {}/{})", name, attempt, max_attempts);
            let outcome = cli.create_key_pair(name)?;
            confirm_on_disk(&keys_root, name, outcome, attempt)
        },
        |err| matches!(err, DeployError::KeyGeneration { .. }),
    );

    match result {
        Ok(keys) => {
            info!("Private key: {}", keys.paths.private.display());
            info!("Public key: {}", keys.paths.public.display());
            Ok(keys)
        }
        Err(err @ (DeployError::KeyGeneration { .. } | DeployError::ElevationDenied { .. })) => {
            Err(err)
        }
        Err(other) => Err(DeployError::KeyGeneration {
            key: name.to_string(),
            attempts: last_attempt,
            reason: other.to_string(),
        }),
    }
}

fn confirm_on_disk(
    keys_root: &Path,
    name: &str,
    outcome: CliOutcome,
    attempt: u32,
) -> DeployResult<ProvisionedKeys> {
    let not_on_disk = |reason: String| DeployError::KeyGeneration {
        key: name.to_string(),
        attempts: attempt,
        reason,
    };

    match outcome {
        CliOutcome::Created => find_existing_pair(keys_root, name)
            .map(|paths| ProvisionedKeys {
                paths,
                source: KeySource::Created,
            })
            .ok_or_else(|| {
                not_on_disk(format!(
                    "veyon-cli reported success but no key files under {}",
                    keys_root.display()
                ))
            }),
        CliOutcome::AlreadyExists => {
            if let Some(paths) = find_existing_pair(keys_root, name) {
                return Ok(ProvisionedKeys {
                    paths,
                    source: KeySource::Existing,
                });
            }
            warn!("veyon-cli says the key pair exists - scanning {}", keys_root.display());
            scan_for_pair(keys_root)
                .map(|paths| ProvisionedKeys {
                    paths,
                    source: KeySource::Discovered,
                })
                .ok_or_else(|| {
                    not_on_disk(format!(
                        "veyon-cli says '{}' already exists but no key files were found under {}",
                        name,
                        keys_root.display()
                    ))
                })
        }
        CliOutcome::Failed { code, output } => {
            // Some versions print an error after writing the files anyway
            if let Some(paths) = find_existing_pair(keys_root, name) {
                warn!("veyon-cli failed (exit code {:?}) but the key files exist", code);
                return Ok(ProvisionedKeys {
                    paths,
                    source: KeySource::Created,
                });
            }
            Err(not_on_disk(format!(
                "veyon-cli exited with code {:?}: {}",
                code, output
            )))
        }
    }
}

// ============================================
// STAGING
// ============================================

/// Copy the key pair into `<root>/keys` and check both files arrived.
pub fn stage_keys(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    keys: &ProvisionedKeys,
) -> DeployResult<KeyPairPaths> {
    let source_root = ctx.paths.vendor_keys_dir();
    let staged_root = ctx.paths.staged_keys_dir();
    let name = ctx.config.key_name.as_str();

    stage_keys_with(ctx, launcher, keys, || {
        copy_into_stage(keys, &source_root, &staged_root, name)
    })
}

/// `stage_keys` with the direct copy passed in.
fn stage_keys_with(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    keys: &ProvisionedKeys,
    copy: impl FnOnce() -> DeployResult<()>,
) -> DeployResult<KeyPairPaths> {
    info!(
        "Staging keys: {} -> {}",
        ctx.paths.vendor_keys_dir().display(),
        ctx.paths.staged_keys_dir().display()
    );

    with_elevated_fallback(copy, |_| stage_elevated(ctx, launcher, keys))?;

    let staged = verify_staged(ctx)?;
    info!("Keys staged to {}", ctx.paths.staged_keys_dir().display());
    Ok(staged)
}

/// Second try after the direct copy was denied: robocopy /E for the
/// canonical tree, or one `copy` per file for a pair found by the scan
/// so it still lands in the canonical layout.
pub fn stage_elevated(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    keys: &ProvisionedKeys,
) -> DeployResult<()> {
    let source_root = ctx.paths.vendor_keys_dir();
    let staged_root = ctx.paths.staged_keys_dir();
    let elevate = !ctx.privilege.is_elevated();

    match keys.source {
        KeySource::Existing | KeySource::Created => {
            let spec = fsops::robocopy_spec(&source_root, &staged_root, RobocopyMode::Copy)
                .elevated(elevate);
            fsops::robocopy_result(launcher.launch(&spec)?, "elevated key copy")
        }
        KeySource::Discovered => {
            let staged = KeyPairPaths::under(&staged_root, &ctx.config.key_name);
            for (from, to) in [
                (&keys.paths.private, &staged.private),
                (&keys.paths.public, &staged.public),
            ] {
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| DeployError::fs("create", parent, e))?;
                }
                let spec = fsops::copy_file_spec(from, to).elevated(elevate);
                fsops::copy_result(launcher.launch(&spec)?, "elevated key copy")?;
            }
            Ok(())
        }
    }
}

/// Both staged files must be there, whichever way they were copied.
fn verify_staged(ctx: &RunContext) -> DeployResult<KeyPairPaths> {
    let staged_root = ctx.paths.staged_keys_dir();
    let expected = KeyPairPaths::under(&staged_root, &ctx.config.key_name);

    for file in [&expected.private, &expected.public] {
        if !file.is_file() {
            return Err(DeployError::MissingKeys {
                expected: file.clone(),
                remediation: format!(
                    "Copy the folder {} to {} by hand (run as administrator if access is denied).",
                    ctx.paths.vendor_keys_dir().display(),
                    staged_root.display()
                ),
            });
        }
    }
    Ok(expected)
}

fn copy_into_stage(
    keys: &ProvisionedKeys,
    source_root: &Path,
    staged_root: &Path,
    name: &str,
) -> DeployResult<()> {
    fsops::remove_tree(staged_root)?;

    match keys.source {
        KeySource::Existing | KeySource::Created => {
            let copied = fsops::copy_tree(source_root, staged_root)?;
            debug!("Copied {} key file(s)", copied);
        }
        KeySource::Discovered => {
            // Put the files found by the scan into the canonical layout
            let staged = KeyPairPaths::under(staged_root, name);
            fsops::copy_file(&keys.paths.private, &staged.private)?;
            fsops::copy_file(&keys.paths.public, &staged.public)?;
        }
    }
    Ok(())
}

// ============================================
// TESTS
// ============================================
