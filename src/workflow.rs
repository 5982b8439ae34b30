// ============================================
// workflow.rs - The three things an operator can do
// ============================================
//
//   teacher    download -> verify -> install (/S) -> key pair -> stage keys\
//   student    download -> verify -> install (/S /Service) -> import keys\
//   uninstall  stop service -> uninstall.exe /S -> optionally purge data
//
// run() is the one place where a failed workflow gets reported: the full
// error and the next manual step go to the log file and the console,
// then the error is handed back so the process exits non-zero.
// ============================================

use std::error::Error;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::distribute::distribute_keys;
use crate::download::{fetch_and_verify, Transport, Verification};
use crate::error::{DeployError, DeployResult};
use crate::installer::run_installer;
use crate::keys::{provision_keys, stage_keys, VendorCli};
use crate::process::ProcessLauncher;
use crate::prompt::Prompt;
use crate::release::fetch_release;
use crate::uninstall::{uninstall, DataOutcome, UninstallerOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    Teacher,
    Student,
    Uninstall,
}

pub struct WorkflowInfo {
    pub workflow: Workflow,
    pub name: &'static str,
    pub description: &'static str,
}

/// Every workflow, in the order `list` shows them.
pub const WORKFLOWS: &[WorkflowInfo] = &[
    WorkflowInfo {
        workflow: Workflow::Teacher,
        name: "teacher",
        description: "Install Veyon Master and stage the key pair in keys\\",
    },
    WorkflowInfo {
        workflow: Workflow::Student,
        name: "student",
        description: "Install the Veyon service and import the staged public key",
    },
    WorkflowInfo {
        workflow: Workflow::Uninstall,
        name: "uninstall",
        description: "Stop the service, run the uninstaller, optionally delete the data folder",
    },
];

impl Workflow {
    pub fn info(self) -> &'static WorkflowInfo {
        // Every variant has a table entry
        WORKFLOWS
            .iter()
            .find(|info| info.workflow == self)
            .unwrap_or(&WORKFLOWS[0])
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }
}

/// The outside world a workflow talks to.
pub struct Services<'a> {
    pub transport: &'a dyn Transport,
    pub launcher: &'a dyn ProcessLauncher,
    pub cli: &'a dyn VendorCli,
    pub prompt: &'a mut dyn Prompt,
}

/// Run `workflow` and report a failure.
pub fn run(workflow: Workflow, ctx: &RunContext, services: &mut Services) -> DeployResult<()> {
    info!("=== {} ===", workflow.info().description);

    let result = match workflow {
        Workflow::Teacher => install_teacher(ctx, services).map(|_| ()),
        Workflow::Student => install_student(ctx, services).map(|_| ()),
        Workflow::Uninstall => run_uninstall(ctx, services),
    };

    match &result {
        Ok(()) => info!("{} workflow completed", workflow.name()),
        Err(err) => report_failure(ctx, workflow, err),
    }
    result
}

fn report_failure(ctx: &RunContext, workflow: Workflow, err: &DeployError) {
    error!("{} workflow failed: {}", workflow.name(), err);

    let mut source = err.source();
    while let Some(cause) = source {
        error!("  caused by: {}", cause);
        source = cause.source();
    }

    if let Some(next) = err.remediation() {
        error!("Next step: {}", next);
    }
    if let Some(log_file) = &ctx.log_file {
        error!("Full log: {}", log_file.display());
    }
}

// ============================================
// INSTALL
// ============================================

/// Download, verify and install.
fn download_and_install(
    ctx: &RunContext,
    services: &Services,
    install_args: &[String],
) -> DeployResult<()> {
    let release = fetch_release(services.transport, &ctx.config)?;

    let mut progress = console_progress();
    let (installer, verification) = fetch_and_verify(
        services.transport,
        &release,
        &ctx.paths.downloads_dir(),
        &mut progress,
    )?;

    match &verification {
        Verification::Verified { sha256 } => {
            info!("Installing {} (SHA256 {})", release.tag, sha256)
        }
        Verification::Unverified { computed } => warn!(
            "Installing {} WITHOUT a published checksum (local SHA256 {})",
            release.tag, computed
        ),
    }

    let outcome = run_installer(ctx, services.launcher, &installer, install_args)?;
    if outcome.exit_code.is_none() {
        warn!("If Veyon is missing afterwards, run {} by hand", installer.display());
    }
    Ok(())
}

/// Teacher machine. Returns the staged public key.
pub fn install_teacher(ctx: &RunContext, services: &mut Services) -> DeployResult<PathBuf> {
    download_and_install(ctx, services, &ctx.config.teacher_install_args)?;

    let keys = provision_keys(ctx, services.cli)?;
    let staged = stage_keys(ctx, services.launcher, &keys)?;

    info!(
        "Copy the folder {} to the student machines",
        ctx.paths.staged_keys_dir().display()
    );
    Ok(staged.public)
}

/// How the student install ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentOutcome {
    KeysImported(PathBuf),
    /// Veyon is installed but the keys still have to be imported by hand
    KeysPending,
}

/// Student machine.
pub fn install_student(ctx: &RunContext, services: &mut Services) -> DeployResult<StudentOutcome> {
    download_and_install(ctx, services, &ctx.config.student_install_args)?;

    match distribute_keys(ctx, services.launcher, &mut *services.prompt) {
        Ok(public_key) => Ok(StudentOutcome::KeysImported(public_key)),
        Err(err @ (DeployError::ElevationDenied { .. } | DeployError::MissingKeys { .. })) => {
            warn!("Veyon is installed but the keys were not imported: {}", err);
            if let Some(next) = err.remediation() {
                warn!("Next step: {}", next);
            }
            Ok(StudentOutcome::KeysPending)
        }
        Err(err) => Err(err),
    }
}

fn run_uninstall(ctx: &RunContext, services: &mut Services) -> DeployResult<()> {
    let report = uninstall(ctx, services.launcher, &mut *services.prompt)?;

    info!("Summary:");
    info!(
        "  service stopped:  {}",
        if report.service_stopped { "yes" } else { "no" }
    );
    match &report.uninstaller {
        UninstallerOutcome::NotFound => info!("  uninstaller:      not found"),
        UninstallerOutcome::Exited(code) => info!("  uninstaller:      exit code {}", code),
        UninstallerOutcome::TimedOut => warn!("  uninstaller:      timed out"),
        UninstallerOutcome::Unknown => info!("  uninstaller:      started, exit code unknown"),
        UninstallerOutcome::Failed(reason) => warn!("  uninstaller:      failed ({})", reason),
    }
    match &report.data {
        DataOutcome::NotPresent => info!("  data folder:      not present"),
        DataOutcome::Kept => info!("  data folder:      kept"),
        DataOutcome::Purged | DataOutcome::PurgedElevated => info!("  data folder:      deleted"),
        DataOutcome::PurgeFailed(reason) => warn!("  data folder:      NOT deleted ({})", reason),
    }
    Ok(())
}

/// Download progress for the console, one line every 10%.
fn console_progress() -> impl FnMut(u32) {
    let mut last_step = None;
    move |percent| {
        let step = percent / 10;
        if last_step != Some(step) {
            last_step = Some(step);
            info!("Downloading... {}%", step * 10);
        }
    }
}

// ============================================
// TESTS
// ============================================
