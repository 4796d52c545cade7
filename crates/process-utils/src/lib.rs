//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Run `program args...` and return the first line of its output.
///
/// Returns `None` when the binary cannot be spawned or exits unsuccessfully,
/// which callers treat as "tool not installed".
pub async fn query_version(program: impl AsRef<OsStr>, args: &[&str]) -> Option<String> {
    let output = tokio_command(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// How a child process ended after a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited before the request.
    AlreadyExited(Option<i32>),
    /// The process exited on its own within the grace window.
    Graceful(Option<i32>),
    /// The process was force-killed after the grace window elapsed.
    Killed,
}

/// Stop a child process within a bounded amount of time.
///
/// `quit_input` is written to the child's stdin (when it is piped) before
/// stdin is closed; ffmpeg for example finalizes its outputs on `q`. If the
/// process has not exited after `grace`, it is killed and reaped.
pub async fn stop_child(
    child: &mut Child,
    quit_input: Option<&[u8]>,
    grace: Duration,
) -> StopOutcome {
    if let Ok(Some(status)) = child.try_wait() {
        return StopOutcome::AlreadyExited(status.code());
    }

    let graceful = async {
        if let Some(mut stdin) = child.stdin.take() {
            if let Some(bytes) = quit_input
                && let Err(e) = stdin.write_all(bytes).await
            {
                debug!("Failed to write quit request to child stdin: {}", e);
            }
            let _ = stdin.shutdown().await;
        }
        child.wait().await
    };

    let result = tokio::time::timeout(grace, graceful).await;
    match result {
        Ok(Ok(status)) => StopOutcome::Graceful(status.code()),
        Ok(Err(e)) => {
            warn!("Error waiting for child process, killing: {}", e);
            force_kill(child).await
        }
        Err(_) => {
            debug!("Child did not exit within {:?}, killing", grace);
            force_kill(child).await
        }
    }
}

async fn force_kill(child: &mut Child) -> StopOutcome {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process: {}", e);
    }
    StopOutcome::Killed
}
