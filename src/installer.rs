// ============================================
// installer.rs - Run the downloaded Veyon installer silently
// ============================================
//
// How it works:
// 1. Copy the verified installer to the local temp folder under a
//    unique name. The UAC-elevated process runs in a different logon
//    session and can't see the operator's mapped network drives, so
//    starting it straight from \\server\share or Z:\ would fail.
// 2. Start it with the silent flags. Already admin -> start directly;
//    otherwise only the installer is elevated through UAC.
// 3. Block until it exits. Refused UAC is fatal, a non-zero exit code
//    is only a warning (the NSIS installer returns 2 on some reboots).
// 4. Delete the staged copy.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::{DeployError, DeployResult};
use crate::fsops;
use crate::process::{ProcessLauncher, ProcessOutcome, ProcessSpec, WaitPolicy};

/// What we know after the installer finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    /// None when the elevated launch gave us no handle to wait on
    pub exit_code: Option<i32>,
}

/// Copy `installer` into `temp_dir` as `veyon-setup-<uuid>-<name>`.
pub fn stage_installer(installer: &Path, temp_dir: &Path) -> DeployResult<PathBuf> {
    let file_name = installer
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DeployError::process("installer", "installer path has no file name"))?;

    let staged = temp_dir.join(format!("veyon-setup-{}-{}", Uuid::new_v4(), file_name));
    fsops::copy_file(installer, &staged)?;
    debug!("Staged installer: {}", staged.display());
    Ok(staged)
}

/// Run the installer at `installer` with `args` and wait for it.
pub fn run_installer(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    installer: &Path,
    args: &[String],
) -> DeployResult<InstallOutcome> {
    let staged = stage_installer(installer, &ctx.paths.local_temp_dir)?;

    let elevate = !ctx.privilege.is_elevated();
    if elevate {
        info!("Not running as administrator - the installer will ask for elevation");
    }

    let spec = ProcessSpec::new(&staged)
        .args(args.iter().cloned())
        .elevated(elevate)
        .wait(WaitPolicy::Indefinite);

    info!("Installing Veyon...");
    let result = launcher.launch(&spec);

    // Best effort: a locked file in %TEMP% is not worth failing the run
    if let Err(e) = fs::remove_file(&staged) {
        debug!("Could not remove staged installer: {}", e);
    }

    let outcome = match result? {
        ProcessOutcome::Exited(0) => {
            info!("Installer finished successfully");
            InstallOutcome { exit_code: Some(0) }
        }
        ProcessOutcome::Exited(code) => {
            warn!("Installer exited with code {}", code);
            InstallOutcome {
                exit_code: Some(code),
            }
        }
        ProcessOutcome::TimedOut | ProcessOutcome::Detached => {
            warn!("Installer exit code is unknown - assuming it finished");
            InstallOutcome { exit_code: None }
        }
    };
    Ok(outcome)
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::Privilege;
    use crate::testing::{test_context, RecordingLauncher};

    fn downloaded_installer(dir: &Path) -> PathBuf {
        let path = dir.join("veyon-4.9.1-win64.exe");
        fs::write(&path, b"MZ fake installer").unwrap();
        path
    }

    #[test]
    fn elevated_run_starts_staged_copy_directly() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let installer = downloaded_installer(dir.path());
        let launcher = RecordingLauncher::new();

        let args = ctx.config.student_install_args.clone();
        let outcome = run_installer(&ctx, &launcher, &installer, &args).unwrap();
        assert_eq!(outcome.exit_code, Some(0));

        let specs = launcher.specs();
        assert_eq!(specs.len(), 1);
        assert!(!specs[0].elevate);
        assert_eq!(specs[0].wait, WaitPolicy::Indefinite);
        assert_eq!(specs[0].args, vec!["/S", "/Service"]);
        assert!(specs[0].program.starts_with(&ctx.paths.local_temp_dir));
        assert!(specs[0]
            .program
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("veyon-setup-"));

        // The staged copy existed while the installer ran and is gone now
        assert_eq!(launcher.programs_present(), vec![true]);
        assert!(!specs[0].program.exists());
        assert!(installer.exists());
    }

    #[test]
    fn unelevated_run_elevates_only_the_installer() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.privilege = Privilege::NotElevated;
        let launcher = RecordingLauncher::new().with_outcome(Ok(ProcessOutcome::Detached));

        let outcome =
            run_installer(&ctx, &launcher, &downloaded_installer(dir.path()), &["/S".to_string()])
                .unwrap();
        assert_eq!(outcome.exit_code, None);
        assert!(launcher.specs()[0].elevate);
    }

    #[test]
    fn non_zero_exit_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let launcher = RecordingLauncher::new().with_outcome(Ok(ProcessOutcome::Exited(2)));

        let outcome =
            run_installer(&ctx, &launcher, &downloaded_installer(dir.path()), &[]).unwrap();
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[test]
    fn refused_uac_is_fatal_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.privilege = Privilege::NotElevated;
        let launcher = RecordingLauncher::new().with_outcome(Err(DeployError::ElevationDenied {
            action: "running the installer".to_string(),
            reason: "the UAC prompt was declined".to_string(),
        }));

        let err = run_installer(&ctx, &launcher, &downloaded_installer(dir.path()), &[])
            .unwrap_err();
        assert!(matches!(err, DeployError::ElevationDenied { .. }));
        assert!(!launcher.specs()[0].program.exists());
    }
}
