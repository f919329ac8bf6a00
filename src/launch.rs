//! Child process launching and exit status relay

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::process::{Command as ProcessCommand, ExitCode, ExitStatus, Stdio};

use log::{debug, info};
#[cfg(unix)]
use nix::sys::signal::{SigHandler, Signal};
#[cfg(unix)]
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::env_file::EnvMap;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Combine the inherited environment with variables from an env file.
///
/// Env file entries overwrite inherited ones with the same name. The result is sorted by name.
#[must_use]
pub fn merge_environment<I, K, V>(inherited: I, overrides: &EnvMap) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut merged: BTreeMap<OsString, OsString> = inherited
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect();
    for (key, value) in overrides {
        merged.insert(key.into(), value.into());
    }
    merged.into_iter().collect()
}

/// A fully prepared child process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(OsString, OsString)>,
}

impl LaunchSpec {
    /// Run `program` directly with `args`.
    #[must_use]
    pub fn new(program: String, args: Vec<String>, env: Vec<(OsString, OsString)>) -> Self {
        Self { program, args, env }
    }

    /// Run a command line through the platform shell.
    #[must_use]
    pub fn shell(command_line: &[String], env: Vec<(OsString, OsString)>) -> Self {
        let line = command_line.join(" ");
        #[cfg(unix)]
        let (program, flag) = ("sh", "-c");
        #[cfg(not(unix))]
        let (program, flag) = ("cmd", "/C");
        Self {
            program: program.to_string(),
            args: vec![flag.to_string(), line],
            env,
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }
}

/// How a launched child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited(i32),
    /// Raw signal number, which may be a realtime signal `nix::Signal` cannot name
    #[cfg(unix)]
    Signaled(i32),
}

impl From<ExitStatus> for LaunchOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(raw) = status.signal() {
                return LaunchOutcome::Signaled(raw);
            }
        }
        LaunchOutcome::Exited(status.code().unwrap_or(1))
    }
}

impl fmt::Display for LaunchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchOutcome::Exited(code) => write!(f, "exited with code {code}"),
            #[cfg(unix)]
            LaunchOutcome::Signaled(raw) => match Signal::try_from(*raw) {
                Ok(signal) => write!(f, "terminated by {signal}"),
                Err(_) => write!(f, "terminated by signal {raw}"),
            },
        }
    }
}

/// Signals a terminal delivers to the whole foreground process group
#[cfg(unix)]
const GROUP_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGQUIT];

/// Serializes the window in which this process ignores group signals.
#[cfg(unix)]
static WAIT_LOCK: Mutex<()> = Mutex::new(());

/// Ignores `GROUP_SIGNALS` in this process until dropped, so the child alone decides what a
/// Ctrl-C means and its outcome is what gets relayed.
#[cfg(unix)]
struct GroupSignalGuard {
    previous: [(Signal, SigHandler); 2],
    _lock: MutexGuard<'static, ()>,
}

#[cfg(unix)]
impl GroupSignalGuard {
    fn ignore() -> Self {
        let lock = WAIT_LOCK.lock();
        let previous = GROUP_SIGNALS.map(|signal| {
            // SAFETY: SigIgn installs no handler code.
            match unsafe { nix::sys::signal::signal(signal, SigHandler::SigIgn) } {
                Ok(handler) => (signal, handler),
                Err(e) => {
                    debug!("Unable to ignore {signal}: {e}");
                    (signal, SigHandler::SigDfl)
                }
            }
        });
        Self {
            previous,
            _lock: lock,
        }
    }

    /// Dispositions the child should start with: whatever this process inherited, except that
    /// installed handlers do not survive exec anyway.
    fn for_child(&self) -> [(Signal, SigHandler); 2] {
        self.previous.map(|(signal, handler)| match handler {
            SigHandler::SigIgn => (signal, SigHandler::SigIgn),
            _ => (signal, SigHandler::SigDfl),
        })
    }
}

#[cfg(unix)]
impl Drop for GroupSignalGuard {
    fn drop(&mut self) {
        for (signal, handler) in self.previous {
            // SAFETY: restores the disposition that was in place before `ignore`.
            if let Err(e) = unsafe { nix::sys::signal::signal(signal, handler) } {
                debug!("Unable to restore {signal}: {e}");
            }
        }
    }
}

/// Spawn the child with inherited stdio and block until it ends.
///
/// # Errors
///
/// Returns `LaunchError::Spawn` if the program cannot be started, or `LaunchError::Wait` if
/// waiting on it fails.
pub fn launch(spec: LaunchSpec) -> Result<LaunchOutcome, LaunchError> {
    debug!("Spawning `{}` with args {:?}", spec.program, spec.args);
    let mut command = ProcessCommand::new(&spec.program);
    command
        .args(&spec.args)
        .env_clear()
        .envs(spec.env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    #[cfg(unix)]
    let guard = {
        use std::os::unix::process::CommandExt;

        let guard = GroupSignalGuard::ignore();
        let for_child = guard.for_child();
        // SAFETY: only async-signal-safe sigaction calls run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                for (signal, handler) in for_child {
                    nix::sys::signal::signal(signal, handler)?;
                }
                Ok(())
            });
        }
        guard
    };

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let status = child.wait().map_err(LaunchError::Wait)?;
    #[cfg(unix)]
    drop(guard);

    let outcome = LaunchOutcome::from(status);
    info!("`{}` {outcome}", spec.program);
    Ok(outcome)
}

/// Turn a child's outcome into this process's own termination.
///
/// A signal is re-raised against the current process, so this does not return in that case
/// unless the signal turns out not to be fatal.
#[must_use]
pub fn relay(outcome: LaunchOutcome) -> ExitCode {
    match outcome {
        LaunchOutcome::Exited(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        #[cfg(unix)]
        LaunchOutcome::Signaled(raw) => {
            reraise(raw);
            u8::try_from(128 + raw).map_or(ExitCode::FAILURE, ExitCode::from)
        }
    }
}

/// Raise a raw signal number against this process with its default disposition.
///
/// Works on raw numbers so realtime signals are relayed as well.
#[cfg(unix)]
fn reraise(signo: i32) {
    use nix::errno::Errno;
    use nix::libc;

    // SAFETY: plain libc signal-state calls on a zero-initialized, locally owned sigset.
    unsafe {
        if libc::signal(signo, libc::SIG_DFL) == libc::SIG_ERR {
            debug!("Unable to reset handler for signal {signo}: {}", Errno::last());
        }
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, signo);
        if libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()) != 0 {
            debug!("Unable to unblock signal {signo}: {}", Errno::last());
        }
        if libc::raise(signo) != 0 {
            debug!("Unable to raise signal {signo}: {}", Errno::last());
        }
    }
}
