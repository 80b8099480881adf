//! Time-bounded execution of untrusted code snippets.
//!
//! Every run spawns one child process that evaluates the snippet inline.
//! All failure modes (unsupported language, missing runtime, timeout,
//! spawn errors) are folded into the `stderr` of a normal result; the
//! caller never sees an error.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// Wall-clock limit for a single run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured output of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub language: String,
}

impl RunResult {
    fn failed(language: &str, stderr: String) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            language: language.to_string(),
        }
    }
}

/// Maps a language identifier to a command evaluating `code` inline.
/// Returns `None` for identifiers with no known runtime.
fn runtime_command(language: &str, code: &str) -> Option<Command> {
    let mut command = match language {
        "python" => {
            let mut c = Command::new("python3");
            c.arg("-c").arg(code);
            c
        }
        "javascript" => {
            let mut c = Command::new("node");
            c.arg("-e").arg(code);
            c
        }
        _ => return None,
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Some(command)
}

async fn read_stream<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Run `code` under the runtime selected by `language`, waiting at most
/// `limit`. On timeout the child is killed and reaped before returning.
pub async fn execute(language: &str, code: &str, limit: Duration) -> RunResult {
    let Some(mut command) = runtime_command(language, code) else {
        return RunResult::failed(language, format!("Unsupported language: {language}"));
    };

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return RunResult::failed(language, format!("Runtime not available for {language}"));
        }
        Err(err) => {
            return RunResult::failed(language, format!("Execution error: {err}"));
        }
    };
    debug!(language, pid = child.id(), "spawned runtime");

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let capture = async {
        let (stdout, stderr, status) = tokio::join!(
            read_stream(stdout_pipe),
            read_stream(stderr_pipe),
            child.wait()
        );
        status.map(|_| (stdout, stderr))
    };

    let outcome = tokio::time::timeout(limit, capture).await;
    match outcome {
        Ok(Ok((stdout, stderr))) => RunResult {
            stdout,
            stderr,
            language: language.to_string(),
        },
        Ok(Err(err)) => RunResult::failed(language, format!("Execution error: {err}")),
        Err(_) => {
            // Kill and reap so the child cannot outlive this call.
            let _ = child.kill().await;
            debug!(language, "run exceeded time limit");
            RunResult::failed(language, "Execution timed out".to_string())
        }
    }
}
