//! Shared data model for the CI action runner.
//!
//! This crate has no I/O of its own. It defines the workflow config shape
//! (`Config`, `Action`, `Triggers`), the identity of one build-event stream
//! (`StreamId`), the build-event vocabulary (`BuildEvent`) and its wire
//! envelope (`OrderedEnvelope`), and the runner's typed error/exit model
//! (`RunnerError`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A byte sink the command runner tees live child-process output into.
///
/// Implemented by the invocation log (`runner-log`); kept here so
/// `runner-process` does not need to depend on `runner-log` just to accept
/// a sink.
pub trait OutputSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

/// A declarative workflow document: a single field, an ordered list of actions.
///
/// Unknown top-level fields are ignored by `serde`'s default behavior (no
/// `deny_unknown_fields`), so a workflow document can carry fields this
/// runner doesn't understand without failing to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// One named build action: a shell-tokenisable command list plus optional triggers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub bazel_commands: Vec<String>,
    #[serde(default)]
    pub triggers: Option<Triggers>,
}

/// Trigger conditions for an action. Absence of a sub-record means that
/// event type never fires the action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default)]
    pub push: Option<BranchSet>,
    #[serde(default)]
    pub pull_request: Option<BranchSet>,
}

/// A list of branch names an event's trigger matches against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchSet {
    #[serde(default)]
    pub branches: Vec<String>,
}

/// The identity of one build-event stream: an invocation UUID paired with a
/// build UUID. Every event published during one action run carries this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamId {
    pub invocation_id: String,
    pub build_id: String,
}

impl StreamId {
    /// Mint a fresh stream identity.
    pub fn new() -> Self {
        Self {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            build_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch, for `BuildEvent` timestamp fields.
/// Shared by every crate that stamps an event so the two callers (the action
/// runner's `Progress`/`Started` events, the driver's `BuildFinished`) can't
/// drift apart on truncation behavior.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// An event id: the address a `BuildEvent` declares for itself and for its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventId {
    Started,
    Progress { opaque_count: i64 },
    WorkspaceStatus,
    BuildFinished,
    BuildToolLogs,
}

/// One of the build events the core emits. Children are declared, not
/// embedded: each variant lists the `EventId`s of events that must later be
/// published to fulfil it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum BuildEvent {
    Started {
        uuid: String,
        start_time_millis: i64,
        children: Vec<EventId>,
    },
    WorkspaceStatus {
        item: BTreeMap<String, String>,
    },
    Progress {
        id: EventId,
        stderr: String,
        children: Vec<EventId>,
    },
    BuildFinished {
        exit_code: i32,
        finish_time_millis: i64,
        children: Vec<EventId>,
    },
    BuildToolLogs {
        last_message: bool,
        files: BTreeMap<String, String>,
    },
}

/// The wire-level record: a `BuildEvent` (or, on the last envelope of a
/// stream, a `ComponentStreamFinished` marker instead) tagged with its
/// stream identity, a strictly increasing sequence number, and a send-time
/// timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedEnvelope {
    pub stream_id: StreamId,
    pub sequence_number: i64,
    pub event_time_millis: i64,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnvelopePayload {
    Event(BuildEvent),
    ComponentStreamFinished,
}

/// Error kinds the core distinguishes, each mapping to exactly one part of
/// the process's exit-code contract.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Missing or invalid CLI flags. Fatal, maps to exit 1.
    #[error("usage error: {0}")]
    Usage(String),

    /// Workflow config missing or malformed. Fatal, maps to exit 1.
    #[error("failed precondition: {0}")]
    Precondition(String),

    /// Transient failure: clone fetch, RPC dial/send/recv, UUID
    /// generation. Maps to the retry-indicating exit code.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A bazel command exited non-zero. Carries the child's own exit code,
    /// which becomes the process's exit code for this condition.
    #[error("action failed with exit code {exit_code}")]
    Action { exit_code: i32 },

    /// A publish failure observed only after all events for a stream were
    /// enqueued; surfaced by `wait()`. Maps to the retry-indicating exit code.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Exit code the executor sees when a clone fetch, a BEP send, or UUID
/// generation fails transiently and the job should be re-queued.
pub const RETRYABLE_EXIT_CODE: i32 = 21;

/// Sentinel exit code substituted when a child process was killed by signal
/// and has no numeric exit code of its own.
pub const NO_EXIT_CODE: i32 = -1;

impl RunnerError {
    /// The process exit code this error kind maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Usage(_) => 1,
            RunnerError::Precondition(_) => 1,
            RunnerError::Transient(_) => RETRYABLE_EXIT_CODE,
            RunnerError::Action { exit_code } => {
                if *exit_code == NO_EXIT_CODE {
                    1
                } else {
                    *exit_code
                }
            }
            RunnerError::Publish(_) => RETRYABLE_EXIT_CODE,
        }
    }
}
