// ============================================
// process.rs - Starting external programs and waiting for them
// ============================================
//
// The tool's only "parallelism" is an external process (installer,
// uninstaller, robocopy, sc, powershell) that we start and then block on.
// ProcessLauncher is the seam the workflows talk to; SystemLauncher is
// the real implementation, tests use a recording fake.
// ============================================

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::elevation::{self, ElevatedLaunch};
use crate::error::{DeployError, DeployResult};

/// How long to block on a started process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    Indefinite,
    Bounded(Duration),
}

/// Window mode for an elevated launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Normal,
    Hidden,
}

/// Everything needed to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Start through the UAC prompt instead of as our own child
    pub elevate: bool,
    pub wait: WaitPolicy,
    pub window: Window,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ProcessSpec {
            program: program.into(),
            args: Vec::new(),
            elevate: false,
            wait: WaitPolicy::Indefinite,
            window: Window::Normal,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    pub fn wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.window = Window::Hidden;
        self
    }

    /// Human readable command line for the log.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.display().to_string()
        } else {
            format!(
                "{} {}",
                self.program.display(),
                elevation::join_args(&self.args)
            )
        }
    }
}

/// How a launched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(i32),
    /// Bounded wait ran out (a direct child is killed)
    TimedOut,
    /// Elevated launch without a handle; we slept the fallback period
    /// and don't know the exit code
    Detached,
}

pub trait ProcessLauncher {
    /// Start a process and block according to `spec.wait`.
    ///
    /// Errors only when the process could not be started at all;
    /// a refused UAC prompt is `DeployError::ElevationDenied`.
    fn launch(&self, spec: &ProcessSpec) -> DeployResult<ProcessOutcome>;
}

// ============================================
// REAL LAUNCHER
// ============================================

pub struct SystemLauncher {
    /// Sleep used when an elevated launch returns no handle
    pub fallback_wait: Duration,
}

impl SystemLauncher {
    pub fn new(fallback_wait: Duration) -> Self {
        SystemLauncher { fallback_wait }
    }

    fn launch_direct(&self, spec: &ProcessSpec) -> DeployResult<ProcessOutcome> {
        let program = spec.program.display().to_string();

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DeployError::process(program.clone(), format!("failed to start: {}", e)))?;

        debug!("{} started (PID: {})", program, child.id());

        match spec.wait {
            WaitPolicy::Indefinite => {
                let status = child
                    .wait()
                    .map_err(|e| DeployError::process(program.clone(), e.to_string()))?;
                Ok(ProcessOutcome::Exited(status.code().unwrap_or(-1)))
            }
            WaitPolicy::Bounded(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    let polled = child
                        .try_wait()
                        .map_err(|e| DeployError::process(program.clone(), e.to_string()))?;
                    if let Some(status) = polled {
                        return Ok(ProcessOutcome::Exited(status.code().unwrap_or(-1)));
                    }
                    if Instant::now() >= deadline {
                        warn!("{} did not finish within {:?} - killing it", program, limit);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(ProcessOutcome::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
            }
        }
    }
}

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &ProcessSpec) -> DeployResult<ProcessOutcome> {
        if !spec.elevate {
            info!("Running: {}", spec.display());
            return self.launch_direct(spec);
        }

        info!("Running elevated (UAC prompt): {}", spec.display());
        match elevation::launch_elevated(spec)? {
            ElevatedLaunch::Exited(code) => Ok(ProcessOutcome::Exited(code)),
            ElevatedLaunch::TimedOut => Ok(ProcessOutcome::TimedOut),
            ElevatedLaunch::NoHandle => {
                elevation::fallback_sleep(self.fallback_wait);
                Ok(ProcessOutcome::Detached)
            }
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments() {
        let spec = ProcessSpec::new("setup.exe")
            .args(["/S", "/Service"])
            .elevated(true)
            .wait(WaitPolicy::Bounded(Duration::from_secs(5)))
            .hidden();
        assert_eq!(spec.args, vec!["/S", "/Service"]);
        assert!(spec.elevate);
        assert_eq!(spec.window, Window::Hidden);
        assert_eq!(spec.display(), "setup.exe /S /Service");
    }

    #[test]
    fn missing_program_is_a_process_error() {
        let launcher = SystemLauncher::new(Duration::ZERO);
        let spec = ProcessSpec::new("definitely-not-a-real-program-4f1c2a");
        assert!(matches!(
            launcher.launch(&spec),
            Err(DeployError::Process { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn direct_launch_reports_exit_code() {
        let launcher = SystemLauncher::new(Duration::ZERO);
        let spec = ProcessSpec::new("sh").args(["-c", "exit 3"]);
        assert_eq!(launcher.launch(&spec).unwrap(), ProcessOutcome::Exited(3));
    }

    #[cfg(unix)]
    #[test]
    fn bounded_wait_kills_slow_process() {
        let launcher = SystemLauncher::new(Duration::ZERO);
        let spec = ProcessSpec::new("sleep")
            .args(["5"])
            .wait(WaitPolicy::Bounded(Duration::from_millis(300)));
        assert_eq!(launcher.launch(&spec).unwrap(), ProcessOutcome::TimedOut);
    }
}
