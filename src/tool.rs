//! Running local command-line backends.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::AttemptError;

/// Output of a finished tool invocation.
pub struct ToolOutput {
    pub stdout: String,
}

/// Runs `program` once, feeding `stdin` if given. A missing executable is
/// `Unavailable`; a non-zero exit is `Failed`.
pub async fn run_tool(program: &str, args: &[String], stdin: Option<&str>) -> Result<ToolOutput, AttemptError> {
    let path = which::which(program)
        .map_err(|_| AttemptError::Unavailable(format!("{program} not found on PATH")))?;
    debug!("running {} {:?}", path.display(), args);

    let mut child = Command::new(&path)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AttemptError::Unavailable(format!("failed to spawn {program}: {e}")))?;

    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(text.as_bytes()).await?;
        // closing stdin signals end of input
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("{} exited with {}: {}", program, output.status, stderr.trim());
        return Err(AttemptError::Failed(format!(
            "{program} exited with {}: {}",
            output.status,
            last_line(&stderr)
        )));
    }

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

/// Reads an audio/image file a tool was asked to write.
pub async fn read_artifact(program: &str, path: &Path) -> Result<Vec<u8>, AttemptError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => Err(AttemptError::Malformed(format!("{program} wrote an empty file"))),
        Err(_) => Err(AttemptError::Malformed(format!(
            "{program} did not write {}",
            path.display()
        ))),
    }
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}
