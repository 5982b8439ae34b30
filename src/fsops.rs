// ============================================
// fsops.rs - Directory copy / delete helpers
// ============================================
//
// All errors go through DeployError::fs so access-denied shows up as
// PermissionDenied and the elevated fallback can kick in.
// The elevated variants build the shell commands (robocopy, PowerShell)
// the Windows way; they are run through a ProcessLauncher.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{DeployError, DeployResult};
use crate::process::{ProcessOutcome, ProcessSpec};

/// Copy the whole tree under `src` into `dst` (created if missing).
/// Returns the number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> DeployResult<u64> {
    fs::create_dir_all(dst).map_err(|e| DeployError::fs("create", dst, e))?;

    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DeployError::process("copy", e.to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| DeployError::fs("create", &target, e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| DeployError::fs("create", parent, e))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| DeployError::fs("copy to", &target, e))?;
            debug!("Copied {} -> {}", entry.path().display(), target.display());
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy a single file, creating the parent folder.
pub fn copy_file(src: &Path, dst: &Path) -> DeployResult<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| DeployError::fs("create", parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| DeployError::fs("copy to", dst, e))?;
    Ok(())
}

/// Remove `path` if it exists.
pub fn remove_tree(path: &Path) -> DeployResult<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|e| DeployError::fs("remove", path, e))?;
    }
    Ok(())
}

/// Clear the read-only attribute on every file below `path`.
/// Best effort: files we can't change are left for remove_tree to report.
pub fn clear_readonly(path: &Path) -> usize {
    let mut cleared = 0;
    for entry in WalkDir::new(path).into_iter().flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut permissions = metadata.permissions();
        if !permissions.readonly() {
            continue;
        }
        make_writable(&mut permissions);
        if fs::set_permissions(entry.path(), permissions).is_ok() {
            debug!("Removed read-only attribute from: {}", entry.path().display());
            cleared += 1;
        }
    }
    cleared
}

#[cfg(windows)]
#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(permissions: &mut fs::Permissions) {
    permissions.set_readonly(false);
}

#[cfg(unix)]
fn make_writable(permissions: &mut fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(permissions.mode() | 0o200);
}

/// Every file below `path`.
pub fn list_files(path: &Path) -> Vec<PathBuf> {
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn walk_error(root: &Path, err: walkdir::Error) -> DeployError {
    let path = err.path().unwrap_or(root).to_path_buf();
    match err.into_io_error() {
        Some(io) => DeployError::fs("read", &path, io),
        None => DeployError::process("copy", format!("filesystem loop at {}", path.display())),
    }
}

// ============================================
// ELEVATED SHELL COMMANDS
// ============================================

/// How robocopy should treat the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobocopyMode {
    /// /E - copy subfolders, keep extra files at the destination
    Copy,
    /// /MIR - make the destination an exact mirror
    Mirror,
}

/// `cmd /c robocopy <src> <dst> ...` - run elevated when the direct copy
/// was denied.
pub fn robocopy_spec(src: &Path, dst: &Path, mode: RobocopyMode) -> ProcessSpec {
    let mode_flag = match mode {
        RobocopyMode::Copy => "/E",
        RobocopyMode::Mirror => "/MIR",
    };
    ProcessSpec::new("cmd.exe")
        .args([
            "/c".to_string(),
            "robocopy".to_string(),
            src.display().to_string(),
            dst.display().to_string(),
            mode_flag.to_string(),
            "/R:1".to_string(),
            "/W:1".to_string(),
        ])
        .hidden()
}

/// robocopy exit codes below 8 mean "copied (or nothing to copy)".
pub fn robocopy_succeeded(code: i32) -> bool {
    (0..8).contains(&code)
}

/// Turn the outcome of an elevated robocopy into a result.
/// A detached launch is accepted; callers re-check the destination.
pub fn robocopy_result(outcome: ProcessOutcome, what: &str) -> DeployResult<()> {
    match outcome {
        ProcessOutcome::Exited(code) if robocopy_succeeded(code) => Ok(()),
        ProcessOutcome::Detached => Ok(()),
        ProcessOutcome::Exited(code) => Err(DeployError::process(
            "robocopy",
            format!("{} failed with exit code {}", what, code),
        )),
        ProcessOutcome::TimedOut => Err(DeployError::process(
            "robocopy",
            format!("{} did not finish", what),
        )),
    }
}

/// `cmd /c copy /Y <src> <dst>` - one file, for the elevated path.
/// The destination folder has to exist already.
pub fn copy_file_spec(src: &Path, dst: &Path) -> ProcessSpec {
    ProcessSpec::new("cmd.exe")
        .args([
            "/c".to_string(),
            "copy".to_string(),
            "/Y".to_string(),
            src.display().to_string(),
            dst.display().to_string(),
        ])
        .hidden()
}

/// `copy` exits with 0 on success; anything else failed.
pub fn copy_result(outcome: ProcessOutcome, what: &str) -> DeployResult<()> {
    match outcome {
        ProcessOutcome::Exited(0) | ProcessOutcome::Detached => Ok(()),
        ProcessOutcome::Exited(code) => Err(DeployError::process(
            "copy",
            format!("{} failed with exit code {}", what, code),
        )),
        ProcessOutcome::TimedOut => Err(DeployError::process(
            "copy",
            format!("{} did not finish", what),
        )),
    }
}

/// PowerShell command that clears attributes and deletes `dir`.
pub fn powershell_remove_spec(dir: &Path) -> ProcessSpec {
    let quoted = dir.display().to_string().replace('\'', "''");
    let script = format!(
        "Get-ChildItem -Path '{0}' -Recurse -Force | ForEach-Object {{ $_.Attributes = 'Normal' }}; \
         Remove-Item -Path '{0}' -Recurse -Force",
        quoted
    );
    ProcessSpec::new("powershell.exe")
        .args([
            "-NoProfile".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-Command".to_string(),
            script,
        ])
        .hidden()
}

// ============================================
// TESTS
// ============================================
