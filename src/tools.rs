//! External conversion tools: availability checking, time-boxed
//! invocation, and stale-child reaping.
//!
//! ## Why a process registry?
//!
//! Conversion tools (LibreOffice, nbconvert) occasionally hang on
//! malformed input. Killing hung converters by process *name and age*
//! is racy — it can take down an unrelated LibreOffice the user has open.
//! Instead every child this library spawns is registered by pid with its
//! spawn instant; the sweep in [`ProcessRegistry::kill_stale`] signals
//! only those pids. Children of aborted worker tasks are additionally
//! covered by `kill_on_drop(true)`, so cancellation cannot leak a
//! converter.
//!
//! Every invocation carries its own timeout, independent of the
//! batch-level deadline: a timeout is reported as a distinct failure mode
//! from a non-zero exit (see [`ConvertError`]).

use crate::error::{ConvertError, PreprocessError};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// An external tool the pipeline shells out to, with the argument used to
/// probe its presence at startup.
#[derive(Debug, Clone, Copy)]
pub struct ExternalTool {
    pub name: &'static str,
    pub probe_args: &'static [&'static str],
}

/// Tools required at startup. Every submission depends on these, so a
/// missing one aborts the run before any work starts.
pub const REQUIRED_TOOLS: &[ExternalTool] = &[
    ExternalTool { name: "pandoc", probe_args: &["--version"] },
    ExternalTool { name: "libreoffice", probe_args: &["--version"] },
    ExternalTool { name: "pdftoppm", probe_args: &["-h"] },
    ExternalTool { name: "pdftotext", probe_args: &["-h"] },
    ExternalTool { name: "pdfinfo", probe_args: &["-v"] },
    ExternalTool { name: "jupyter", probe_args: &["--version"] },
    ExternalTool { name: "7z", probe_args: &[] },
];

/// Verify that every required external tool is invocable.
///
/// This is the one deliberately fatal check in the pipeline: it runs
/// exactly once, before processing, and failure aborts the whole run.
pub async fn check_dependencies() -> Result<(), PreprocessError> {
    let mut missing = Vec::new();
    for tool in REQUIRED_TOOLS {
        let probe = Command::new(tool.name)
            .args(tool.probe_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(Duration::from_secs(20), probe).await {
            Ok(Ok(status)) if status.success() => {
                info!("✓ {} is available", tool.name);
            }
            Ok(Ok(status)) => {
                warn!("{} probe exited {}", tool.name, status);
                missing.push(tool.name.to_string());
            }
            Ok(Err(e)) => {
                warn!("{} not invocable: {}", tool.name, e);
                missing.push(tool.name.to_string());
            }
            Err(_) => {
                warn!("{} probe timed out", tool.name);
                missing.push(tool.name.to_string());
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PreprocessError::MissingTools { tools: missing })
    }
}

#[derive(Debug)]
struct TrackedChild {
    tool: String,
    spawned: Instant,
}

/// Registry of child processes spawned by this run.
///
/// Shared across worker tasks; entries live from spawn to exit. The
/// registry deliberately knows nothing about processes it did not spawn.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<u32, TrackedChild>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, pid: Option<u32>, tool: &str) -> TrackGuard<'_> {
        if let Some(pid) = pid {
            self.inner.lock().unwrap().insert(
                pid,
                TrackedChild {
                    tool: tool.to_string(),
                    spawned: Instant::now(),
                },
            );
        }
        TrackGuard {
            registry: self,
            pid,
        }
    }

    /// Number of currently tracked children.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill tracked children older than `max_age`. Returns how many were
    /// signalled.
    ///
    /// Only pids this registry handed out are touched, so the sweep can
    /// never hit a process the pipeline did not start.
    pub fn kill_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<(u32, String)> = {
            let map = self.inner.lock().unwrap();
            map.iter()
                .filter(|(_, c)| c.spawned.elapsed() > max_age)
                .map(|(pid, c)| (*pid, c.tool.clone()))
                .collect()
        };

        let mut killed = 0;
        for (pid, tool) in stale {
            warn!("Killing stale {} process (pid {})", tool, pid);
            if signal_kill(pid) {
                killed += 1;
            }
            self.inner.lock().unwrap().remove(&pid);
        }
        killed
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGKILL pid {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_kill(pid: u32) -> bool {
    debug!("stale-process kill unsupported on this platform (pid {})", pid);
    false
}

/// Guard that deregisters a tracked pid when the invocation finishes,
/// whether it exited, timed out, or the future was dropped.
struct TrackGuard<'a> {
    registry: &'a ProcessRegistry,
    pid: Option<u32>,
}

impl Drop for TrackGuard<'_> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            self.registry.inner.lock().unwrap().remove(&pid);
        }
    }
}

/// Run an external tool with a hard timeout, capturing output.
///
/// The child is registered in `registry` for the stale sweep and spawned
/// with `kill_on_drop`, so a timeout (which drops the wait future) also
/// kills the process. Returns:
/// * `Err(ConvertError::Timeout)` — deadline expired, child killed;
/// * `Err(ConvertError::ToolFailed)` — non-zero exit, stderr attached;
/// * `Err(ConvertError::SpawnFailed)` — binary missing or not executable.
pub async fn run_tool<S: AsRef<OsStr>>(
    registry: &ProcessRegistry,
    tool: &str,
    args: &[S],
    timeout: Duration,
) -> Result<std::process::Output, ConvertError> {
    debug!(
        "exec {} {:?} (timeout {}s)",
        tool,
        args.iter().map(|a| a.as_ref()).collect::<Vec<&OsStr>>(),
        timeout.as_secs()
    );

    let child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ConvertError::SpawnFailed {
            tool: tool.to_string(),
            detail: e.to_string(),
        })?;

    let _guard = registry.track(child.id(), tool);

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Err(_) => Err(ConvertError::Timeout {
            tool: tool.to_string(),
            secs: timeout.as_secs(),
        }),
        Ok(Err(e)) => Err(ConvertError::Io {
            detail: format!("waiting for {}: {}", tool, e),
        }),
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(output)
            } else {
                Err(ConvertError::ToolFailed {
                    tool: tool.to_string(),
                    status: output.status.to_string(),
                    stderr: ConvertError::trim_detail(&String::from_utf8_lossy(&output.stderr)),
                })
            }
        }
    }
}
