//! Top-level driver for the CI action runner.
//!
//! Parses flags, fetches the commit under test, loads its workflow config,
//! and for each action whose trigger matches the invocation, streams a
//! synthetic build-event sequence to the results backend while driving the
//! action's `bazel_commands`. See `runner-types::RunnerError` for the
//! exit-code contract this binary implements.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use runner_action::ActionContext;
use runner_bes::Publisher;
use runner_log::InvocationLog;
use runner_types::{now_millis, BuildEvent, EventId, RunnerError, StreamId};
use tokio_util::sync::CancellationToken;

/// Flags are declared with empty-string defaults, not `clap`'s own
/// `required`, so that "present but empty" and "absent" are both caught by
/// [`validate_flags`] and reported as the same `Usage` error with an exit
/// code we control, rather than clap's built-in required-arg check (exit 2,
/// message we don't control).
#[derive(Parser, Debug)]
#[command(
    name = "ci_runner",
    version,
    about = "Fetches a commit, selects matching workflow actions, and streams their build events to the results backend"
)]
struct Cli {
    /// Git remote to clone.
    #[arg(long = "repo_url", default_value = "")]
    repo_url: String,

    /// Revision to check out.
    #[arg(long = "commit_sha", default_value = "")]
    commit_sha: String,

    /// Triggering event: "push", "pull_request", or any other string
    /// (which never fires an action).
    #[arg(long = "trigger_event", default_value = "")]
    trigger_event: String,

    /// Branch name compared against an action's trigger branch lists.
    #[arg(long = "trigger_branch", default_value = "")]
    trigger_branch: String,

    /// Target for the build-event RPC. Scheme `grpc` implies plaintext,
    /// anything else implies TLS.
    #[arg(long = "bes_backend", default_value = "")]
    bes_backend: String,

    /// Prefix used to print a human invocation link.
    #[arg(long = "bes_results_url", default_value = "")]
    bes_results_url: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match try_run(cli).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            eprintln!("ci_runner: {e}");
            e.exit_code()
        }
    }
}

async fn try_run(cli: Cli) -> Result<i32, RunnerError> {
    validate_flags(&cli)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c_listener(cancel.clone());

    let working_dir = runner_git::default_working_dir();
    let clone_ctx = runner_git::CloneContext {
        repo_url: cli.repo_url.clone(),
        commit_sha: cli.commit_sha.clone(),
        repo_user: std::env::var("REPO_USER").ok(),
        repo_token: std::env::var("REPO_TOKEN").ok(),
    };

    runner_git::clone(&clone_ctx, &working_dir).map_err(|e| match e {
        runner_git::GitError::Transient(err) => RunnerError::Transient(format!("{err:#}")),
        runner_git::GitError::Fatal(err) => RunnerError::Precondition(format!("{err:#}")),
    })?;

    let config = runner_config::load_from_dir(&working_dir)
        .map_err(|e| RunnerError::Precondition(format!("{e:#}")))?;

    let workspace_status = build_workspace_status(&cli, &working_dir);

    let mut exit_code = 0;

    for action in &config.actions {
        if !runner_config::matches(action, &cli.trigger_event, &cli.trigger_branch) {
            eprintln!(
                "ci_runner: action '{}' skipped (trigger does not match)",
                action.name
            );
            continue;
        }

        let stream_id = StreamId::new();
        let publisher = Arc::new(Publisher::new(stream_id.clone(), cli.bes_backend.clone()));
        publisher.start(cancel.clone());

        println!(
            "Streaming build results for '{}' to: {}",
            action.name,
            invocation_url(&cli.bes_results_url, &stream_id.invocation_id)
        );

        let log = Arc::new(InvocationLog::new());
        let ctx = ActionContext {
            working_dir: working_dir.clone(),
            workspace_status: workspace_status.clone(),
            cancel: cancel.clone(),
        };

        let start = Instant::now();
        let action_result = runner_action::run(action, &ctx, log, publisher.clone()).await;
        // `RunnerError::exit_code()` is the single place that substitutes 1
        // for `NO_EXIT_CODE` (a command killed by signal); route through it
        // rather than reading `exit_code` off `Action` directly, or a
        // signal-killed command's -1 would reach the process exit raw.
        let action_exit_code = match &action_result {
            Ok(()) => 0,
            Err(e) => e.exit_code(),
        };

        // Regardless of outcome, publish the closing handshake. These
        // publishes are allowed to fail silently for the same reason
        // publishes inside the action runner are: `publisher.wait()` below
        // is the single source of truth for whether the backend actually
        // learned the outcome.
        let _ = publisher
            .publish(BuildEvent::BuildFinished {
                exit_code: action_exit_code,
                finish_time_millis: now_millis(),
                children: vec![EventId::BuildToolLogs],
            })
            .await;

        let mut files = BTreeMap::new();
        files.insert(
            "elapsed time".to_string(),
            format!("{:.6}", start.elapsed().as_secs_f64()),
        );
        let _ = publisher
            .publish(BuildEvent::BuildToolLogs {
                last_message: true,
                files,
            })
            .await;

        publisher.wait().await?;

        if action_exit_code != 0 {
            exit_code = action_exit_code;
        }
    }

    Ok(exit_code)
}

fn validate_flags(cli: &Cli) -> Result<(), RunnerError> {
    let required = [
        ("--repo_url", &cli.repo_url),
        ("--commit_sha", &cli.commit_sha),
        ("--trigger_event", &cli.trigger_event),
        ("--trigger_branch", &cli.trigger_branch),
        ("--bes_backend", &cli.bes_backend),
        ("--bes_results_url", &cli.bes_results_url),
    ];

    for (flag, value) in required {
        if value.is_empty() {
            return Err(RunnerError::Usage(format!("{flag} is required")));
        }
    }

    Ok(())
}

fn spawn_ctrl_c_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

/// Join a results-URL prefix and an invocation id with exactly one `/`.
fn invocation_url(results_url: &str, invocation_id: &str) -> String {
    if results_url.ends_with('/') {
        format!("{results_url}{invocation_id}")
    } else {
        format!("{results_url}/{invocation_id}")
    }
}

fn build_workspace_status(cli: &Cli, working_dir: &Path) -> BTreeMap<String, String> {
    let mut item = BTreeMap::new();
    item.insert("BUILD_USER".to_string(), build_user());
    item.insert(
        "BUILD_HOST".to_string(),
        gethostname::gethostname().to_string_lossy().into_owned(),
    );
    item.insert("REPO_URL".to_string(), cli.repo_url.clone());
    item.insert("COMMIT_SHA".to_string(), cli.commit_sha.clone());
    item.insert("GIT_TREE_STATUS".to_string(), git_tree_status(working_dir));
    // GIT_BRANCH is deliberately omitted: `--trigger_branch` is ambiguous
    // for the pull-request case (head branch vs. base branch), so there is
    // no single value that wouldn't mislead.
    item
}

fn build_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn git_tree_status(working_dir: &Path) -> String {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(working_dir)
        .output();

    match output {
        Ok(o) if o.status.success() && o.stdout.is_empty() => "Clean".to_string(),
        Ok(o) if o.status.success() => "Modified".to_string(),
        _ => "Unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(overrides: &[(&str, &str)]) -> Cli {
        let mut cli = Cli {
            repo_url: "https://example.invalid/repo".to_string(),
            commit_sha: "deadbeef".to_string(),
            trigger_event: "push".to_string(),
            trigger_branch: "main".to_string(),
            bes_backend: "grpc://127.0.0.1:1".to_string(),
            bes_results_url: "https://app.example.invalid/invocation".to_string(),
        };

        for (field, value) in overrides {
            match *field {
                "repo_url" => cli.repo_url = value.to_string(),
                "commit_sha" => cli.commit_sha = value.to_string(),
                "trigger_event" => cli.trigger_event = value.to_string(),
                "trigger_branch" => cli.trigger_branch = value.to_string(),
                "bes_backend" => cli.bes_backend = value.to_string(),
                "bes_results_url" => cli.bes_results_url = value.to_string(),
                other => panic!("unknown field {other}"),
            }
        }

        cli
    }

    #[test]
    fn validate_flags_accepts_fully_populated_cli() {
        assert!(validate_flags(&cli(&[])).is_ok());
    }

    #[test]
    fn validate_flags_rejects_every_empty_field() {
        for field in [
            "repo_url",
            "commit_sha",
            "trigger_event",
            "trigger_branch",
            "bes_backend",
            "bes_results_url",
        ] {
            let err = validate_flags(&cli(&[(field, "")])).expect_err("must reject empty field");
            assert!(matches!(err, RunnerError::Usage(_)));
        }
    }

    #[test]
    fn invocation_url_has_exactly_one_slash() {
        assert_eq!(
            invocation_url("https://app.example.com/invocation", "abc-123"),
            "https://app.example.com/invocation/abc-123"
        );
        assert_eq!(
            invocation_url("https://app.example.com/invocation/", "abc-123"),
            "https://app.example.com/invocation/abc-123"
        );
    }

    #[test]
    fn git_tree_status_reports_clean_and_modified() {
        let td = tempfile::tempdir().expect("tempdir");
        Command::new("git")
            .args(["init"])
            .current_dir(td.path())
            .status()
            .expect("git init");
        Command::new("git")
            .args(["config", "user.email", "ci@example.com"])
            .current_dir(td.path())
            .status()
            .expect("git config");
        Command::new("git")
            .args(["config", "user.name", "CI"])
            .current_dir(td.path())
            .status()
            .expect("git config");

        assert_eq!(git_tree_status(td.path()), "Clean");

        std::fs::write(td.path().join("untracked.txt"), "x").expect("write");
        assert_eq!(git_tree_status(td.path()), "Modified");
    }

    #[test]
    fn build_workspace_status_omits_git_branch() {
        let cli = cli(&[]);
        let td = tempfile::tempdir().expect("tempdir");
        let status = build_workspace_status(&cli, td.path());

        assert!(status.contains_key("BUILD_USER"));
        assert!(status.contains_key("BUILD_HOST"));
        assert_eq!(status.get("REPO_URL"), Some(&cli.repo_url));
        assert_eq!(status.get("COMMIT_SHA"), Some(&cli.commit_sha));
        assert!(status.contains_key("GIT_TREE_STATUS"));
        assert!(!status.contains_key("GIT_BRANCH"));
    }
}
