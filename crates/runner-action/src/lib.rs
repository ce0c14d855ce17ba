//! Per-action orchestration for the CI action runner.
//!
//! [`run`] turns one [`Action`] into a synthetic build-event stream: it
//! emits the lifecycle events, drives each `bazel_commands` entry through
//! the command runner with its output teed into the invocation log, and
//! keeps that log flushed into `Progress` events both on a threshold
//! trigger and on a periodic timer. The caller owns the [`Publisher`]'s
//! start/wait and the closing `BuildFinished`/`BuildToolLogs` pair -- see
//! the top-level driver in `runner-cli`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use runner_bes::Publisher;
use runner_log::InvocationLog;
use runner_types::{now_millis, Action, BuildEvent, EventId, OutputSink, RunnerError};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

/// Buffer size, in bytes, past which a log write triggers an immediate
/// progress flush.
pub const PROGRESS_FLUSH_THRESHOLD_BYTES: usize = 1000;

/// Interval of the periodic progress flusher.
pub const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one action run needs beyond the `Action` record itself.
pub struct ActionContext {
    pub working_dir: PathBuf,
    /// Pre-assembled workspace status items (`BUILD_USER`, `BUILD_HOST`,
    /// `REPO_URL`, `COMMIT_SHA`, `GIT_TREE_STATUS`, ...); assembling these
    /// is the top-level driver's job, since it is the one holding the
    /// clone context.
    pub workspace_status: BTreeMap<String, String>,
    /// Process-wide cancellation, propagated into every `bazelisk`
    /// invocation. Cancelling this does not by itself stop the command
    /// loop -- the currently running child is killed and its failure
    /// surfaces as a normal command error.
    pub cancel: CancellationToken,
}

/// Run one action to completion. The caller is responsible for the closing
/// `BuildFinished`/`BuildToolLogs` pair and for `publisher.wait()`.
pub async fn run(
    action: &Action,
    ctx: &ActionContext,
    log: Arc<InvocationLog>,
    publisher: Arc<Publisher>,
) -> Result<(), RunnerError> {
    // Guards the whole consume-count-publish sequence of `flush_progress`
    // so the two concurrent callers (this function's own command loop, and
    // the background flush task below) can never interleave: without this,
    // one flush's `consume()` could land between another's `consume()` and
    // its `progress_count` increment, assigning opaque counts out of step
    // with publish order and producing a non-monotonic `Progress` chain on
    // the wire. Held across the `publish().await` too, since serialising
    // only the count update still lets two publishes race onto the queue
    // in the wrong order.
    let progress_count = Arc::new(AsyncMutex::new(0i64));

    // Publish failures are swallowed here: a latched publisher error is
    // re-surfaced by the driver's later `publisher.wait()`, and reporting
    // it twice would be misleading. Only command failures
    // (`RunnerError::Action`) and tokenisation failures bubble out of
    // this function.
    let _ = publisher
        .publish(BuildEvent::Started {
            uuid: publisher.stream_id().invocation_id.clone(),
            start_time_millis: now_millis(),
            children: vec![
                EventId::Progress { opaque_count: 0 },
                EventId::WorkspaceStatus,
                EventId::BuildFinished,
            ],
        })
        .await;

    flush_progress(&log, &publisher, &progress_count).await;

    let _ = publisher
        .publish(BuildEvent::WorkspaceStatus {
            item: ctx.workspace_status.clone(),
        })
        .await;

    // The write listener never flushes itself: it only wakes the single
    // background flush task below via `Notify`, so every flush -- whether
    // threshold-triggered or periodic -- runs from that one task and is
    // trivially ordered against the other. A detached `tokio::spawn` per
    // threshold crossing would let a flush's publish still be in flight
    // after `run()` returns, racing the driver's closing `BuildFinished`.
    let flush_notify = Arc::new(Notify::new());
    let listener_log = log.clone();
    let listener_notify = flush_notify.clone();
    log.set_write_listener(move || {
        if listener_log.len() >= PROGRESS_FLUSH_THRESHOLD_BYTES {
            listener_notify.notify_one();
        }
    });

    let flusher_cancel = CancellationToken::new();
    let flusher_handle = {
        let log = log.clone();
        let publisher = publisher.clone();
        let progress_count = progress_count.clone();
        let cancel = flusher_cancel.clone();
        let notify = flush_notify.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_FLUSH_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        flush_progress(&log, &publisher, &progress_count).await;
                    }
                    _ = notify.notified() => {
                        flush_progress(&log, &publisher, &progress_count).await;
                    }
                }
            }
            // A write can land between the last select branch firing and
            // cancellation; drain it here so nothing is left unflushed
            // once this task (and `run()`'s await on it below) completes.
            flush_progress(&log, &publisher, &progress_count).await;
        })
    };

    let result = run_commands(action, ctx, &log, &progress_count, &publisher).await;

    flusher_cancel.cancel();
    // Awaiting this join handle is what guarantees no `Progress` publish
    // from this action is still in flight once `run()` returns -- the
    // driver publishes `BuildFinished` immediately afterwards, and relative
    // event ordering requires that publish to be the next one enqueued.
    let _ = flusher_handle.await;

    result
}

async fn run_commands(
    action: &Action,
    ctx: &ActionContext,
    log: &Arc<InvocationLog>,
    progress_count: &AsyncMutex<i64>,
    publisher: &Publisher,
) -> Result<(), RunnerError> {
    for command in &action.bazel_commands {
        let mut tokens = shlex::split(command).ok_or_else(|| {
            RunnerError::Precondition(format!("unbalanced quoting in command: {command}"))
        })?;

        if matches!(
            tokens.first().map(String::as_str),
            Some("bazel") | Some("bazelisk")
        ) {
            tokens.remove(0);
        }

        let quoted = tokens
            .iter()
            .map(|t| shell_quote(t))
            .collect::<Vec<_>>()
            .join(" ");
        log.writeln(&format!("\x1b[36m$\x1b[0m bazelisk {quoted}"));

        let sink: Arc<dyn OutputSink> = log.clone();
        let status = runner_process::run(
            "bazelisk",
            &tokens,
            &ctx.working_dir,
            &[],
            sink,
            &ctx.cancel,
        )
        .await
        .map_err(|e| RunnerError::Precondition(format!("failed to run bazelisk: {e:#}")))?;

        if status.code != runner_types::NO_EXIT_CODE {
            log.writeln(&format!("\x1b[2m(command exited with code {})\x1b[0m", status.code));
        }

        flush_progress(log, publisher, progress_count).await;

        if !status.success() {
            return Err(RunnerError::Action { exit_code: status.code });
        }
    }

    Ok(())
}

/// Consume the log buffer and, if non-empty, publish it as a `Progress`
/// event whose declared child is `progress_count + 1`.
///
/// Holds `progress_count`'s lock across the whole consume-count-publish
/// sequence: any concurrent caller blocks until this one has both assigned
/// its opaque count and enqueued the matching publish, so two racing
/// flushes can never assign counts in one order while enqueuing their
/// `Progress` events in another.
///
/// A publish failure here is swallowed: `progress_count` is still
/// advanced so the chain stays monotonic even if this particular event
/// never made it onto the wire, and the driver's `wait()` is what
/// ultimately reports the failure.
async fn flush_progress(log: &InvocationLog, publisher: &Publisher, progress_count: &AsyncMutex<i64>) {
    let mut count = progress_count.lock().await;

    let bytes = log.consume();
    if bytes.is_empty() {
        return;
    }

    let this_count = *count;
    *count += 1;
    let event = BuildEvent::Progress {
        id: EventId::Progress { opaque_count: this_count },
        stderr: String::from_utf8_lossy(&bytes).into_owned(),
        children: vec![EventId::Progress {
            opaque_count: this_count + 1,
        }],
    };

    let _ = publisher.publish(event).await;
}

/// POSIX shell quoting: a token made up only of `[A-Za-z0-9@%+=:,./-]` is
/// returned unchanged; otherwise it is wrapped in single quotes with
/// embedded single quotes escaped as `'"'"'`.
pub fn shell_quote(token: &str) -> String {
    let is_safe = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-".contains(c));

    if is_safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', "'\"'\"'"))
    }
}


#[cfg(test)]
mod property_tests {
    use super::shell_quote;
    use proptest::prelude::*;

    proptest! {
        /// A token made up only of the safe-character set round-trips
        /// unchanged; any other token comes back single-quoted.
        #[test]
        fn shell_quote_roundtrips_safe_tokens(token in "[A-Za-z0-9@%+=:,./-]{0,32}") {
            prop_assert_eq!(shell_quote(&token), token);
        }

        #[test]
        fn shell_quote_always_wraps_tokens_with_a_space(
            prefix in "[A-Za-z0-9]{1,8}",
            suffix in "[A-Za-z0-9]{1,8}",
        ) {
            let token = format!("{prefix} {suffix}");
            let quoted = shell_quote(&token);
            prop_assert!(quoted.starts_with('\''));
            prop_assert!(quoted.ends_with('\''));
        }
    }
}
