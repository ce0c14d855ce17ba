//! Async child-process execution with live output capture.
//!
//! `run` spawns a child, merges `env` onto the parent's environment, and
//! tees both of the child's output streams into an [`OutputSink`] as the
//! bytes arrive -- not after the child exits, which is what lets the
//! action runner flush `Progress` events while a long-running `bazel`
//! invocation is still writing output.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use runner_types::{OutputSink, NO_EXIT_CODE};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Outcome of a finished child process.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    /// The child's numeric exit code, or [`NO_EXIT_CODE`] if it was killed
    /// by signal and never reported one.
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Spawn `executable args...` in `working_dir`, merging `env` onto the
/// parent's environment, teeing stdout and stderr into `sink` as lines
/// arrive. Returns the child's exit status; a non-zero or signalled exit is
/// not itself an error here -- the caller (the action runner) decides what
/// a failing exit code means.
///
/// `cancel` is the process-wide cancellation token: if it fires before the
/// child exits, the child is killed and this returns an error rather than a
/// synthetic exit status, since there is no real exit code to report.
pub async fn run(
    executable: &str,
    args: &[String],
    working_dir: &Path,
    env: &[(String, String)],
    sink: Arc<dyn OutputSink>,
    cancel: &CancellationToken,
) -> Result<ExitStatus> {
    let mut command = Command::new(executable);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {executable} {args:?}"))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_sink = sink.clone();
    let stdout_task = tokio::spawn(async move { pump(stdout, stdout_sink).await });
    let stderr_sink = sink.clone();
    let stderr_task = tokio::spawn(async move { pump(stderr, stderr_sink).await });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            anyhow::bail!("{executable} cancelled");
        }
        status = child.wait() => status.with_context(|| format!("failed to wait on {executable}"))?,
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(ExitStatus {
        code: status.code().unwrap_or(NO_EXIT_CODE),
    })
}

/// Copy lines from `reader` into `sink`, newline included, until EOF.
async fn pump<R: AsyncRead + Unpin>(reader: R, sink: Arc<dyn OutputSink>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                sink.write(line.as_bytes());
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// Check if a command exists in `PATH`.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink(Mutex<Vec<u8>>);

    impl OutputSink for CollectingSink {
        fn write(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    #[tokio::test]
    async fn run_captures_stdout() {
        let sink: Arc<dyn OutputSink> = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let status = run(
            "printf",
            &["hello\n".to_string()],
            Path::new("."),
            &[],
            sink.clone(),
            &CancellationToken::new(),
        )
        .await
        .expect("run");

        assert!(status.success());
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let sink: Arc<dyn OutputSink> = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let status = run(
            "false",
            &[],
            Path::new("."),
            &[],
            sink,
            &CancellationToken::new(),
        )
        .await
        .expect("run");

        assert!(!status.success());
        assert_eq!(status.code, 1);
    }

    #[tokio::test]
    async fn run_merges_env() {
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let sink_dyn: Arc<dyn OutputSink> = sink.clone();
        run(
            "sh",
            &["-c".to_string(), "printf \"$MY_VAR\"".to_string()],
            Path::new("."),
            &[("MY_VAR".to_string(), "injected".to_string())],
            sink_dyn,
            &CancellationToken::new(),
        )
        .await
        .expect("run");

        let captured = sink.0.lock().unwrap().clone();
        assert_eq!(String::from_utf8_lossy(&captured), "injected");
    }

    #[tokio::test]
    async fn run_is_killed_by_a_cancelled_token() {
        let sink: Arc<dyn OutputSink> = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run(
            "sleep",
            &["5".to_string()],
            Path::new("."),
            &[],
            sink,
            &cancel,
        )
        .await
        .expect_err("cancelled run must fail");
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn command_exists_for_shell() {
        assert!(command_exists("sh"));
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }
}
