//! Child-process plumbing shared by the command-line model adapters.

use crate::error::{Result, SynthesisError};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const TRANSIENT_MARKERS: [&str; 6] = [
    "out of memory",
    "cuda error",
    "cudnn",
    "resource exhausted",
    "device-side assert",
    "killed",
];

/// GPU/resource exhaustion is worth a retry; anything else points at the input.
pub(crate) fn is_transient_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Run a model command to completion, mapping failures to inference errors.
/// The child is killed if the returned future is dropped.
pub(crate) async fn run_inference(mut cmd: Command, label: &str) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(target: "model", command = ?cmd, "Running {}", label);
    let output = cmd
        .output()
        .await
        .map_err(|e| SynthesisError::inference(format!("{} failed to start: {}", label, e), false))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail_lines(&stderr, 8);
        return Err(SynthesisError::inference(
            format!("{} exited with {}: {}", label, output.status, tail),
            is_transient_failure(&stderr),
        ));
    }
    Ok(())
}

/// Check that a model entry point starts at all; used while loading.
pub(crate) async fn probe(mut cmd: Command, model: &str, limit: Duration) -> Result<()> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let load_err = |message: String| SynthesisError::ModelLoad {
        model: model.to_string(),
        message,
    };
    let output = timeout(limit, cmd.output())
        .await
        .map_err(|_| load_err(format!("{} did not answer within {:?}", program, limit)))?
        .map_err(|e| load_err(format!("{} could not be started: {}", program, e)))?;

    if !output.status.success() {
        return Err(load_err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            tail_lines(&String::from_utf8_lossy(&output.stderr), 8)
        )));
    }
    Ok(())
}

fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
