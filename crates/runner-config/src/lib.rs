//! Workflow configuration loading and trigger matching for the CI action runner.
//!
//! This crate is split in two halves: loading the declarative workflow
//! document (`load`), and deciding which of its actions fire for a given
//! triggering event (`matches`).

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use runner_types::{Action, Config};

/// Workflow config file name, read from the repository root after checkout.
pub const CONFIG_FILE: &str = "buildbuddy.yaml";

/// Path to the workflow config within a checked-out repository root.
pub fn config_path(repo_root: &Path) -> std::path::PathBuf {
    repo_root.join(CONFIG_FILE)
}

/// Parse a workflow document from any reader.
///
/// Returns a "failed precondition" error (via `anyhow::Context`) if the
/// document cannot be parsed; an absent file is the caller's concern (see
/// [`load_from_dir`]), since a reader has no notion of "file does not
/// exist".
pub fn load<R: Read>(mut reader: R) -> Result<Config> {
    let mut contents = String::new();
    reader
        .read_to_string(&mut contents)
        .context("failed to read workflow config")?;

    serde_yaml::from_str(&contents).context("failed to parse workflow config")
}

/// Load the workflow config from `buildbuddy.yaml` in the given repository root.
///
/// A missing file and a malformed file are both reported as precondition
/// failures -- the caller (the top-level driver) does not distinguish them
/// further, since both are fatal and non-retryable.
pub fn load_from_dir(repo_root: &Path) -> Result<Config> {
    let path = config_path(repo_root);
    let file = std::fs::File::open(&path)
        .with_context(|| format!("workflow config not found at {}", path.display()))?;
    load(file)
}

/// The triggering event kind, taken verbatim from `--trigger_event`.
///
/// Any value other than `"push"` or `"pull_request"` never fires an action;
/// it is not an error, it simply never matches.
pub type Event<'a> = &'a str;

/// Decide whether `action` fires for `(event, branch)`.
///
/// `false` whenever `action.triggers` is absent. For `event == "push"`,
/// returns whether `branch` is in `triggers.push.branches` (if that
/// sub-record is present). Symmetric for `"pull_request"`. Any other event
/// name, or a trigger sub-record that is absent for the matching event,
/// returns `false`.
pub fn matches(action: &Action, event: Event<'_>, branch: &str) -> bool {
    let Some(triggers) = &action.triggers else {
        return false;
    };

    match event {
        "push" => triggers
            .push
            .as_ref()
            .is_some_and(|set| set.branches.iter().any(|b| b == branch)),
        "pull_request" => triggers
            .pull_request
            .as_ref()
            .is_some_and(|set| set.branches.iter().any(|b| b == branch)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_types::{BranchSet, Triggers};

    fn action_with_push(branches: &[&str]) -> Action {
        Action {
            name: "build".to_string(),
            bazel_commands: vec!["bazel version".to_string()],
            triggers: Some(Triggers {
                push: Some(BranchSet {
                    branches: branches.iter().map(|s| s.to_string()).collect(),
                }),
                pull_request: None,
            }),
        }
    }

    #[test]
    fn no_triggers_never_matches() {
        let action = Action {
            name: "build".to_string(),
            bazel_commands: vec![],
            triggers: None,
        };
        assert!(!matches(&action, "push", "main"));
        assert!(!matches(&action, "pull_request", "main"));
    }

    #[test]
    fn push_matches_listed_branch() {
        let action = action_with_push(&["main", "release"]);
        assert!(matches(&action, "push", "main"));
        assert!(!matches(&action, "push", "dev"));
    }

    #[test]
    fn unknown_event_never_matches() {
        let action = action_with_push(&["main"]);
        assert!(!matches(&action, "tag", "main"));
    }

    #[test]
    fn pull_request_absent_never_matches() {
        let action = action_with_push(&["main"]);
        assert!(!matches(&action, "pull_request", "main"));
    }

    #[test]
    fn load_parses_actions() {
        let yaml = r#"
actions:
  - name: build
    bazel_commands:
      - "bazel build //..."
    triggers:
      push:
        branches: ["main"]
"#;
        let config = load(yaml.as_bytes()).expect("load");
        assert_eq!(config.actions.len(), 1);
        assert_eq!(config.actions[0].name, "build");
    }

    #[test]
    fn load_rejects_malformed_document() {
        let bad = b"actions: [this is not valid: yaml: at: all";
        assert!(load(&bad[..]).is_err());
    }

    #[test]
    fn load_from_dir_reports_missing_file() {
        let td = tempfile::tempdir().expect("tempdir");
        let err = load_from_dir(td.path()).expect_err("should fail");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn load_from_dir_reads_existing_file() {
        let td = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            config_path(td.path()),
            "actions:\n  - name: test\n    bazel_commands: []\n",
        )
        .expect("write");

        let config = load_from_dir(td.path()).expect("load");
        assert_eq!(config.actions[0].name, "test");
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// `false` whenever `action.triggers` is absent, for any
        /// event/branch pair at all.
        #[test]
        fn no_triggers_never_matches_any_event(event in "[a-z_]{0,16}", branch in "[a-zA-Z0-9/_-]{0,16}") {
            let action = Action {
                name: "build".to_string(),
                bazel_commands: vec![],
                triggers: None,
            };
            prop_assert!(!matches(&action, &event, &branch));
        }

        /// Any event name other than `push`/`pull_request` never fires an
        /// action, even one with both trigger sub-records set.
        #[test]
        fn unknown_events_never_match(
            event in "[a-z_]{1,16}".prop_filter("not a known event", |e| e != "push" && e != "pull_request"),
            branch in "[a-zA-Z0-9/_-]{1,16}",
        ) {
            let action = Action {
                name: "build".to_string(),
                bazel_commands: vec![],
                triggers: Some(Triggers {
                    push: Some(BranchSet { branches: vec![branch.clone()] }),
                    pull_request: Some(BranchSet { branches: vec![branch.clone()] }),
                }),
            };
            prop_assert!(!matches(&action, &event, &branch));
        }
    }
}
