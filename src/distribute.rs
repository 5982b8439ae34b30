// ============================================
// distribute.rs - Student side: import the teacher's keys
// ============================================
//
// The operator brings the keys\ folder staged on the teacher machine
// (see keys.rs) and runs the student install from the same folder.
// We replace %ProgramData%\Veyon\keys with that folder.
//
// ProgramData\Veyon is usually only writable by administrators. When
// the plain copy is denied and we aren't admin yet, the operator is
// asked whether to retry with an elevated robocopy.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::{DeployError, DeployResult};
use crate::fsops::{self, RobocopyMode};
use crate::keys::KeyPairPaths;
use crate::process::{ProcessLauncher, WaitPolicy};
use crate::prompt::Prompt;
use crate::retry::with_elevated_fallback;

/// Copy the staged key folder into the Veyon data folder.
/// Returns the imported public key.
pub fn distribute_keys(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    prompt: &mut dyn Prompt,
) -> DeployResult<PathBuf> {
    let staged_root = ctx.paths.staged_keys_dir();
    let target_root = ctx.paths.vendor_keys_dir();

    distribute_keys_with(ctx, launcher, prompt, || {
        fsops::remove_tree(&target_root)?;
        let copied = fsops::copy_tree(&staged_root, &target_root)?;
        info!("Copied {} key file(s)", copied);
        Ok(())
    })
}

/// `distribute_keys` with the direct copy passed in.
fn distribute_keys_with(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    prompt: &mut dyn Prompt,
    copy: impl FnOnce() -> DeployResult<()>,
) -> DeployResult<PathBuf> {
    let staged_root = ctx.paths.staged_keys_dir();
    let target_root = ctx.paths.vendor_keys_dir();
    let name = ctx.config.key_name.as_str();

    let staged = KeyPairPaths::under(&staged_root, name);
    if !staged.public.is_file() {
        return Err(DeployError::MissingKeys {
            expected: staged.public.clone(),
            remediation: missing_keys_help(&staged_root, name),
        });
    }

    info!("Importing keys: {} -> {}", staged_root.display(), target_root.display());

    with_elevated_fallback(copy, |err| {
        on_permission_denied(ctx, launcher, prompt, &staged_root, &target_root, err)
    })?;

    let imported = KeyPairPaths::under(&target_root, name).public;
    verify_same_content(&staged.public, &imported)?;
    info!("Public key imported: {}", imported.display());
    Ok(imported)
}

/// Second chance after the direct copy was denied.
///
/// Already elevated means the denial is real and `err` is returned.
/// Otherwise the operator decides whether to retry through UAC.
pub fn on_permission_denied(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    prompt: &mut dyn Prompt,
    staged_root: &Path,
    target_root: &Path,
    err: DeployError,
) -> DeployResult<()> {
    if ctx.privilege.is_elevated() {
        return Err(err);
    }

    warn!("Access denied writing {}", target_root.display());
    if !prompt.confirm("Retry the key copy with administrator rights?", true) {
        return Err(DeployError::ElevationDenied {
            action: "copying the keys".to_string(),
            reason: "operator declined".to_string(),
        });
    }

    let spec = fsops::robocopy_spec(staged_root, target_root, RobocopyMode::Mirror)
        .elevated(true)
        .wait(WaitPolicy::Indefinite);
    fsops::robocopy_result(launcher.launch(&spec)?, "elevated key copy")
}

/// Byte-for-byte comparison of the staged and the imported key.
fn verify_same_content(source: &Path, copy: &Path) -> DeployResult<()> {
    let expected = fs::read(source).map_err(|e| DeployError::fs("read", source, e))?;
    let actual = match fs::read(copy) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DeployError::MissingKeys {
                expected: copy.to_path_buf(),
                remediation: format!(
                    "Copy {} to {} by hand as administrator.",
                    source.display(),
                    copy.display()
                ),
            })
        }
        Err(e) => return Err(DeployError::fs("read", copy, e)),
    };

    if expected != actual {
        return Err(DeployError::Integrity {
            file: copy.to_path_buf(),
            expected: hex::encode(Sha256::digest(&expected)),
            actual: hex::encode(Sha256::digest(&actual)),
        });
    }
    Ok(())
}

fn missing_keys_help(staged_root: &Path, name: &str) -> String {
    format!(
        "Run the teacher install first, then copy its keys folder next to this program.\n\
         Expected layout:\n\
         \x20 {root}\\public\\{name}\\key\n\
         \x20 {root}\\private\\{name}\\key (optional on students)",
        root = staged_root.display(),
        name = name
    )
}

// ============================================
// TESTS
// ============================================
