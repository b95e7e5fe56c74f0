//! Child process supervision shared by the measurement and proxy wrappers.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MeasureError;

/// Grace period between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Spawn `command`, capture its output and wait for it to exit.
///
/// The child is terminated when `cancel` trips or `timeout` elapses; those
/// cases return [`MeasureError::Cancelled`] and [`MeasureError::TimedOut`].
/// A non-zero exit is not an error here; callers inspect `Output::status`.
pub async fn run_to_completion(
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Output, MeasureError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| MeasureError::Spawn {
        program: command.as_std().get_program().to_string_lossy().into_owned(),
        source,
    })?;
    let pid = child.id();
    debug!(pid, "measurement process spawned");

    let stdout = child.stdout.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            info!(pid, "cancellation requested, terminating measurement process");
            terminate_child(&mut child, TERMINATE_GRACE).await;
            return Err(MeasureError::Cancelled);
        }
        _ = &mut deadline => {
            warn!(pid, timeout_secs = timeout.as_secs(), "measurement process timed out, terminating");
            terminate_child(&mut child, TERMINATE_GRACE).await;
            return Err(MeasureError::TimedOut { secs: timeout.as_secs() });
        }
        status = child.wait() => status?,
    };

    let stdout = match stdout {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match stderr {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    debug!(pid, exit_code = status.code(), "measurement process exited");

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Ask the child to stop with SIGTERM, then SIGKILL it after `grace`.
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = run_to_completion(command, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "err");
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut command = Command::new("sleep");
        command.arg("30");
        let started = std::time::Instant::now();
        let result = run_to_completion(command, Duration::from_secs(60), &cancel).await;

        assert!(matches!(result, Err(MeasureError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let result =
            run_to_completion(command, Duration::from_millis(100), &CancellationToken::new()).await;
        assert!(matches!(result, Err(MeasureError::TimedOut { .. })));
    }
}
