//! Subprocess supervision shared by the tool wrappers.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{MediaError, MediaResult};

/// Wait for `child`, killing it on cancellation or when `timeout` passes.
pub(crate) async fn wait_child(
    child: &mut Child,
    tool: &str,
    timeout: Duration,
    token: &CancellationToken,
) -> MediaResult<ExitStatus> {
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        waited = tokio::time::timeout(timeout, child.wait()) => Some(waited),
    };

    match outcome {
        Some(Ok(status)) => Ok(status?),
        Some(Err(_)) => {
            warn!("{} timed out after {:?}, killing process", tool, timeout);
            let _ = child.kill().await;
            Err(MediaError::Timeout(timeout.as_secs()))
        }
        None => {
            info!("{} cancelled, killing process", tool);
            let _ = child.kill().await;
            Err(MediaError::Cancelled)
        }
    }
}

/// Last `max_lines` non-empty lines of tool output.
pub(crate) fn tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
