// ============================================
// uninstall.rs - Remove Veyon from a machine
// ============================================
//
// Steps (each one is allowed to fail without stopping the next):
// 1. sc stop VeyonService    - so the uninstaller can replace/remove files
// 2. uninstall.exe /S        - bounded wait, a hung uninstaller is killed
// 3. short pause             - NSIS keeps deleting after it exits
// 4. ask before deleting %ProgramData%\Veyon (keys + configuration)
//
// A machine without Veyon is not an error: nothing is started and
// nothing is asked.
// ============================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::context::RunContext;
use crate::error::{DeployError, DeployResult};
use crate::fsops;
use crate::process::{ProcessLauncher, ProcessOutcome, ProcessSpec, WaitPolicy};
use crate::prompt::Prompt;
use crate::retry::with_elevated_fallback;

/// `sc stop` exit codes that mean "the service is not running now".
/// 1060 = service does not exist, 1062 = service not started.
const SERVICE_STOPPED_CODES: [i32; 3] = [0, 1060, 1062];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallerOutcome {
    NotFound,
    Exited(i32),
    TimedOut,
    /// Elevated launch without a handle
    Unknown,
    /// Could not be started at all
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    NotPresent,
    /// Operator chose to keep it
    Kept,
    Purged,
    PurgedElevated,
    PurgeFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallReport {
    pub service_stopped: bool,
    pub uninstaller: UninstallerOutcome,
    pub data: DataOutcome,
}

impl UninstallReport {
    pub fn nothing_installed() -> Self {
        UninstallReport {
            service_stopped: false,
            uninstaller: UninstallerOutcome::NotFound,
            data: DataOutcome::NotPresent,
        }
    }
}

/// `%ProgramFiles%\Veyon\uninstall.exe`, then the x86 folder.
pub fn locate_uninstaller(ctx: &RunContext) -> Option<PathBuf> {
    ctx.paths
        .find_vendor_program(&ctx.config.uninstaller_executable)
}

pub fn uninstall(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    prompt: &mut dyn Prompt,
) -> DeployResult<UninstallReport> {
    let uninstaller = locate_uninstaller(ctx);
    let data_dir = &ctx.paths.vendor_data_dir;

    if uninstaller.is_none() && !data_dir.exists() {
        info!("Veyon is not installed - nothing to do");
        return Ok(UninstallReport::nothing_installed());
    }

    let service_stopped = stop_service(launcher, &ctx.config.service_name);

    let uninstaller = match uninstaller {
        Some(path) => {
            let outcome = run_uninstaller(ctx, launcher, &path);
            let settle = Duration::from_secs(ctx.config.post_uninstall_settle_secs);
            if !settle.is_zero() {
                std::thread::sleep(settle);
            }
            outcome
        }
        None => {
            warn!("Uninstaller not found - only the data folder is left");
            UninstallerOutcome::NotFound
        }
    };

    let data = if data_dir.exists() {
        purge_data_dir(ctx, launcher, prompt, data_dir)
    } else {
        DataOutcome::NotPresent
    };

    info!("Uninstall finished");
    Ok(UninstallReport {
        service_stopped,
        uninstaller,
        data,
    })
}

fn stop_service(launcher: &dyn ProcessLauncher, service: &str) -> bool {
    info!("Stopping service {}", service);
    let spec = ProcessSpec::new("sc").args(["stop", service]).hidden();

    match launcher.launch(&spec) {
        Ok(ProcessOutcome::Exited(code)) if SERVICE_STOPPED_CODES.contains(&code) => true,
        Ok(outcome) => {
            warn!("sc stop {} did not succeed ({:?}) - continuing", service, outcome);
            false
        }
        Err(e) => {
            warn!("Could not run sc stop {}: {} - continuing", service, e);
            false
        }
    }
}

fn run_uninstaller(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    path: &Path,
) -> UninstallerOutcome {
    let spec = ProcessSpec::new(path)
        .args(ctx.config.uninstall_args.iter().cloned())
        .elevated(!ctx.privilege.is_elevated())
        .wait(WaitPolicy::Bounded(ctx.config.uninstall_timeout()));

    info!("Running uninstaller: {}", spec.display());
    match launcher.launch(&spec) {
        Ok(ProcessOutcome::Exited(0)) => {
            info!("Uninstaller finished");
            UninstallerOutcome::Exited(0)
        }
        Ok(ProcessOutcome::Exited(code)) => {
            warn!("Uninstaller exited with code {}", code);
            UninstallerOutcome::Exited(code)
        }
        Ok(ProcessOutcome::TimedOut) => {
            warn!(
                "Uninstaller did not finish within {}s",
                ctx.config.uninstall_timeout_secs
            );
            UninstallerOutcome::TimedOut
        }
        Ok(ProcessOutcome::Detached) => UninstallerOutcome::Unknown,
        Err(DeployError::ElevationDenied { reason, .. }) => {
            warn!("Uninstaller not started, UAC declined ({}) - continuing", reason);
            UninstallerOutcome::Failed(format!("UAC declined: {}", reason))
        }
        Err(e) => {
            warn!("Could not run the uninstaller: {}", e);
            UninstallerOutcome::Failed(e.to_string())
        }
    }
}

fn purge_data_dir(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    prompt: &mut dyn Prompt,
    data_dir: &Path,
) -> DataOutcome {
    purge_data_dir_with(ctx, launcher, prompt, data_dir, || remove_directly(data_dir))
}

/// `purge_data_dir` with the direct removal passed in.
fn purge_data_dir_with(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    prompt: &mut dyn Prompt,
    data_dir: &Path,
    remove: impl FnOnce() -> DeployResult<DataOutcome>,
) -> DataOutcome {
    let question = format!(
        "Delete the Veyon data folder {} (keys and configuration)?",
        data_dir.display()
    );
    if !prompt.confirm(&question, false) {
        info!("Keeping {}", data_dir.display());
        return DataOutcome::Kept;
    }

    match with_elevated_fallback(remove, |_| purge_elevated(ctx, launcher, data_dir)) {
        Ok(outcome) => {
            info!("Removed {}", data_dir.display());
            outcome
        }
        Err(e) => {
            warn!("Could not remove {}: {}", data_dir.display(), e);
            if let Some(next) = e.remediation() {
                warn!("{}", next);
            }
            DataOutcome::PurgeFailed(e.to_string())
        }
    }
}

fn remove_directly(data_dir: &Path) -> DeployResult<DataOutcome> {
    let cleared = fsops::clear_readonly(data_dir);
    if cleared > 0 {
        info!("Cleared read-only attribute on {} file(s)", cleared);
    }
    fsops::remove_tree(data_dir)?;
    Ok(DataOutcome::Purged)
}

/// Delete `data_dir` through an elevated PowerShell after the direct
/// removal was denied. The folder has to be gone afterwards.
pub fn purge_elevated(
    ctx: &RunContext,
    launcher: &dyn ProcessLauncher,
    data_dir: &Path,
) -> DeployResult<DataOutcome> {
    let spec = fsops::powershell_remove_spec(data_dir)
        .elevated(!ctx.privilege.is_elevated())
        .wait(WaitPolicy::Indefinite);
    launcher.launch(&spec)?;

    if data_dir.exists() {
        return Err(DeployError::process(
            "powershell",
            format!("{} still exists after the elevated delete", data_dir.display()),
        ));
    }
    Ok(DataOutcome::PurgedElevated)
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::Privilege;
    use crate::testing::{test_context, RecordingLauncher, ScriptedPrompt};
    use std::fs;
    use std::io;

    fn install_fake_veyon(ctx: &RunContext) -> PathBuf {
        let program_dir = &ctx.paths.vendor_program_dirs[0];
        fs::create_dir_all(program_dir).unwrap();
        let uninstaller = program_dir.join("uninstall.exe");
        fs::write(&uninstaller, b"MZ").unwrap();
        fs::create_dir_all(ctx.paths.vendor_keys_dir().join("public/supervisor")).unwrap();
        fs::write(ctx.paths.vendor_keys_dir().join("public/supervisor/key"), b"pub").unwrap();
        uninstaller
    }

    #[test]
    fn nothing_installed_means_no_process_and_no_question() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let launcher = RecordingLauncher::new();
        let mut prompt = ScriptedPrompt::new();

        let report = uninstall(&ctx, &launcher, &mut prompt).unwrap();
        assert_eq!(report, UninstallReport::nothing_installed());
        assert!(launcher.specs().is_empty());
        assert!(prompt.questions().is_empty());
    }

    #[test]
    fn full_uninstall_keeps_data_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let uninstaller = install_fake_veyon(&ctx);
        let launcher = RecordingLauncher::new();
        let mut prompt = ScriptedPrompt::new();

        let report = uninstall(&ctx, &launcher, &mut prompt).unwrap();
        assert!(report.service_stopped);
        assert_eq!(report.uninstaller, UninstallerOutcome::Exited(0));
        assert_eq!(report.data, DataOutcome::Kept);
        assert!(ctx.paths.vendor_data_dir.exists());

        let specs = launcher.specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].args, vec!["stop", "VeyonService"]);
        assert_eq!(specs[1].program, uninstaller);
        assert_eq!(specs[1].args, vec!["/S"]);
        assert_eq!(
            specs[1].wait,
            WaitPolicy::Bounded(Duration::from_secs(120))
        );
        assert_eq!(prompt.questions().len(), 1);
    }

    #[test]
    fn service_missing_and_hung_uninstaller_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        install_fake_veyon(&ctx);
        let launcher = RecordingLauncher::new()
            .with_outcome(Ok(ProcessOutcome::Exited(1060)))
            .with_outcome(Ok(ProcessOutcome::TimedOut));
        let mut prompt = ScriptedPrompt::answering(vec![true]);

        let report = uninstall(&ctx, &launcher, &mut prompt).unwrap();
        assert!(report.service_stopped);
        assert_eq!(report.uninstaller, UninstallerOutcome::TimedOut);
        assert_eq!(report.data, DataOutcome::Purged);
        assert!(!ctx.paths.vendor_data_dir.exists());
    }

    #[test]
    fn failed_service_stop_is_only_logged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        install_fake_veyon(&ctx);
        let launcher = RecordingLauncher::new().with_outcome(Ok(ProcessOutcome::Exited(5)));

        let report = uninstall(&ctx, &launcher, &mut ScriptedPrompt::new()).unwrap();
        assert!(!report.service_stopped);
        assert_eq!(report.uninstaller, UninstallerOutcome::Exited(0));
    }

    #[test]
    fn leftover_data_without_uninstaller_can_be_purged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::create_dir_all(ctx.paths.vendor_keys_dir()).unwrap();
        let launcher = RecordingLauncher::new();
        let mut prompt = ScriptedPrompt::answering(vec![true]);

        let report = uninstall(&ctx, &launcher, &mut prompt).unwrap();
        assert_eq!(report.uninstaller, UninstallerOutcome::NotFound);
        assert_eq!(report.data, DataOutcome::Purged);
        // only sc stop ran
        assert_eq!(launcher.specs().len(), 1);
    }

    #[test]
    fn unelevated_uninstaller_goes_through_uac() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.privilege = Privilege::NotElevated;
        install_fake_veyon(&ctx);
        let launcher = RecordingLauncher::new()
            .with_outcome(Ok(ProcessOutcome::Exited(0)))
            .with_outcome(Ok(ProcessOutcome::Detached));

        let report = uninstall(&ctx, &launcher, &mut ScriptedPrompt::new()).unwrap();
        assert_eq!(report.uninstaller, UninstallerOutcome::Unknown);
        let specs = launcher.specs();
        assert!(!specs[0].elevate);
        assert!(specs[1].elevate);
    }

    #[test]
    fn refused_uac_for_uninstaller_still_offers_the_purge() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.privilege = Privilege::NotElevated;
        install_fake_veyon(&ctx);
        let launcher = RecordingLauncher::new()
            .with_outcome(Ok(ProcessOutcome::Exited(0)))
            .with_outcome(Err(DeployError::ElevationDenied {
                action: "starting uninstall.exe".to_string(),
                reason: "the UAC prompt was declined".to_string(),
            }));
        let mut prompt = ScriptedPrompt::answering(vec![true]);

        let report = uninstall(&ctx, &launcher, &mut prompt).unwrap();
        assert!(matches!(
            report.uninstaller,
            UninstallerOutcome::Failed(ref reason) if reason.contains("UAC declined")
        ));
        assert_eq!(prompt.questions().len(), 1);
        assert_eq!(report.data, DataOutcome::Purged);
        assert!(!ctx.paths.vendor_data_dir.exists());
    }

    fn denied() -> DeployResult<DataOutcome> {
        Err(DeployError::fs(
            "remove",
            Path::new("C:/ProgramData/Veyon"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        ))
    }

    #[test]
    fn denied_purge_falls_back_to_elevated_powershell() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(dir.path());
        ctx.privilege = Privilege::NotElevated;
        install_fake_veyon(&ctx);
        let data_dir = ctx.paths.vendor_data_dir.clone();
        let removed = data_dir.clone();
        let launcher = RecordingLauncher::new().with_effect(move |_| {
            fs::remove_dir_all(&removed).unwrap();
        });
        let mut prompt = ScriptedPrompt::answering(vec![true]);

        let outcome = purge_data_dir_with(&ctx, &launcher, &mut prompt, &data_dir, denied);
        assert_eq!(outcome, DataOutcome::PurgedElevated);
        assert!(!data_dir.exists());

        let specs = launcher.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].program, PathBuf::from("powershell.exe"));
        assert!(specs[0].elevate);
        assert!(specs[0].args.last().unwrap().contains("Remove-Item"));
    }

    #[test]
    fn elevated_purge_that_leaves_the_folder_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        install_fake_veyon(&ctx);
        let data_dir = ctx.paths.vendor_data_dir.clone();
        let launcher = RecordingLauncher::new();
        let mut prompt = ScriptedPrompt::answering(vec![true]);

        let outcome = purge_data_dir_with(&ctx, &launcher, &mut prompt, &data_dir, denied);
        assert!(matches!(outcome, DataOutcome::PurgeFailed(ref reason) if reason.contains("still exists")));
        assert!(data_dir.exists());
        // already admin: no UAC prompt for the delete
        assert!(!launcher.specs()[0].elevate);
    }

    #[test]
    fn declined_purge_never_touches_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        install_fake_veyon(&ctx);
        let data_dir = ctx.paths.vendor_data_dir.clone();
        let launcher = RecordingLauncher::new();
        let mut prompt = ScriptedPrompt::answering(vec![false]);

        let outcome = purge_data_dir_with(&ctx, &launcher, &mut prompt, &data_dir, || {
            panic!("removal must not run when the operator says no")
        });
        assert_eq!(outcome, DataOutcome::Kept);
        assert!(launcher.specs().is_empty());
    }
}
