// ============================================
// elevation.rs - Administrator checks and UAC launches
// ============================================
//
// Two things live here:
//   1. Privilege::detect()  - are WE running as administrator?
//   2. launch_elevated()    - start ONE other process through the UAC
//                             prompt ("runas"), without elevating the
//                             whole orchestrator.
//
// launch_elevated() asks ShellExecuteExW for a process handle. With a
// handle we can wait for the process and read its exit code. Without
// one (some shells fire and forget) the caller falls back to a fixed
// sleep.
//
// On non-Windows hosts we always report Elevated; the elevated launch
// itself is only available on Windows.
// ============================================

use std::time::Duration;

use crate::error::{DeployError, DeployResult};
use crate::process::{ProcessSpec, WaitPolicy};

/// Privilege level of the running orchestrator, determined once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Elevated,
    NotElevated,
}

impl Privilege {
    pub fn detect() -> Privilege {
        if is_elevated() {
            Privilege::Elevated
        } else {
            Privilege::NotElevated
        }
    }

    pub fn is_elevated(self) -> bool {
        self == Privilege::Elevated
    }
}

/// What an elevated launch gave back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevatedLaunch {
    /// We had a handle and the process exited with this code
    Exited(i32),
    /// We had a handle but the bounded wait ran out
    TimedOut,
    /// UAC accepted the launch but gave us no handle to wait on
    NoHandle,
}

/// Quote arguments for a ShellExecute parameter string.
pub fn join_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(' ') || arg.contains('\t') {
                format!("\"{}\"", arg.replace('"', "\\\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg_attr(not(windows), allow(dead_code))]
fn wait_millis(wait: WaitPolicy) -> Option<u32> {
    match wait {
        WaitPolicy::Indefinite => None,
        WaitPolicy::Bounded(limit) => Some(limit.as_millis().min(u32::MAX as u128 - 1) as u32),
    }
}

// ============================================
// WINDOWS IMPLEMENTATION
// ============================================

#[cfg(windows)]
fn is_elevated() -> bool {
    use std::mem::size_of;
    use winapi::ctypes::c_void;
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    let mut token: HANDLE = std::ptr::null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        tracing::warn!(
            "Could not open process token: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }

    let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
    let mut returned = 0u32;
    let ok = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut c_void,
            size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    unsafe { CloseHandle(token) };

    if ok == 0 {
        tracing::warn!(
            "Could not query token elevation: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }
    elevation.TokenIsElevated != 0
}

#[cfg(not(windows))]
fn is_elevated() -> bool {
    true
}

/// Launch `spec` through the UAC prompt and wait according to its policy.
#[cfg(windows)]
pub fn launch_elevated(spec: &ProcessSpec) -> DeployResult<ElevatedLaunch> {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use winapi::shared::winerror::{ERROR_CANCELLED, WAIT_TIMEOUT};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::GetExitCodeProcess;
    use winapi::um::shellapi::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use winapi::um::synchapi::WaitForSingleObject;
    use winapi::um::winbase::{INFINITE, WAIT_FAILED};
    use winapi::um::winuser::{SW_HIDE, SW_SHOWNORMAL};

    use crate::process::Window;

    fn wide(value: &OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    let program_name = spec.program.display().to_string();
    let verb = wide(OsStr::new("runas"));
    let file = wide(spec.program.as_os_str());
    let params = wide(OsStr::new(&join_args(&spec.args)));

    let mut info: SHELLEXECUTEINFOW = unsafe { std::mem::zeroed() };
    info.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
    info.fMask = SEE_MASK_NOCLOSEPROCESS;
    info.lpVerb = verb.as_ptr();
    info.lpFile = file.as_ptr();
    info.lpParameters = params.as_ptr();
    info.nShow = match spec.window {
        Window::Hidden => SW_HIDE,
        Window::Normal => SW_SHOWNORMAL,
    };

    if unsafe { ShellExecuteExW(&mut info) } == 0 {
        let os_error = std::io::Error::last_os_error();
        let reason = if os_error.raw_os_error() == Some(ERROR_CANCELLED as i32) {
            "the UAC prompt was declined".to_string()
        } else {
            format!("ShellExecuteExW failed: {}", os_error)
        };
        return Err(DeployError::ElevationDenied {
            action: format!("starting {}", program_name),
            reason,
        });
    }

    let handle = info.hProcess;
    if handle.is_null() {
        return Ok(ElevatedLaunch::NoHandle);
    }

    let timeout = wait_millis(spec.wait).unwrap_or(INFINITE);
    let waited = unsafe { WaitForSingleObject(handle, timeout) };

    let result = if waited == WAIT_TIMEOUT {
        Ok(ElevatedLaunch::TimedOut)
    } else if waited == WAIT_FAILED {
        Err(DeployError::process(
            program_name.clone(),
            format!("waiting failed: {}", std::io::Error::last_os_error()),
        ))
    } else {
        let mut code = 0u32;
        if unsafe { GetExitCodeProcess(handle, &mut code) } == 0 {
            Err(DeployError::process(
                program_name.clone(),
                format!("could not read exit code: {}", std::io::Error::last_os_error()),
            ))
        } else {
            Ok(ElevatedLaunch::Exited(code as i32))
        }
    };

    unsafe { CloseHandle(handle) };
    result
}

#[cfg(not(windows))]
pub fn launch_elevated(spec: &ProcessSpec) -> DeployResult<ElevatedLaunch> {
    Err(DeployError::ElevationDenied {
        action: format!("starting {}", spec.program.display()),
        reason: "UAC elevation is only available on Windows".to_string(),
    })
}

/// Fixed wait used when an elevated launch gave us no process handle.
pub fn fallback_sleep(wait: Duration) {
    tracing::warn!(
        "No process handle available - waiting {} seconds for it to finish...",
        wait.as_secs()
    );
    std::thread::sleep(wait);
}

// ============================================
// TESTS
// ============================================
