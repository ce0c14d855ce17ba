//! Repository fetch sequencing for the CI action runner.
//!
//! [`clone`] drives a fixed sequence: create the working directory, `git
//! init`, construct an authenticated remote URL, `git remote add`, `git
//! fetch` the specific commit, and `git checkout` it. Every step but the
//! fetch is a fatal failure; fetch failures are classified
//! [`GitError::Transient`] so the caller can map them to the
//! retry-indicating exit code.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

/// Name of the working directory the runner clones into, relative to the
/// process's current directory.
pub const REPO_ROOT: &str = "repo-root";

/// Everything [`clone`] needs: where to clone from, what to check out, and
/// the credentials (if any) to inject into the remote URL.
#[derive(Debug, Clone)]
pub struct CloneContext {
    pub repo_url: String,
    pub commit_sha: String,
    pub repo_user: Option<String>,
    pub repo_token: Option<String>,
}

/// Failures [`clone`] can report. [`GitError::Transient`] is the only
/// retryable kind -- it corresponds to the `git fetch` step.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),

    #[error("transient clone failure: {0}")]
    Transient(anyhow::Error),
}

/// Run the clone/checkout sequence in `working_dir` (normally `./repo-root`).
pub fn clone(ctx: &CloneContext, working_dir: &Path) -> Result<(), GitError> {
    std::fs::create_dir_all(working_dir)
        .with_context(|| format!("failed to create {}", working_dir.display()))?;

    run_git(working_dir, &["init"]).context("git init failed")?;

    let auth_url = auth_repo_url(&ctx.repo_url, ctx.repo_user.as_deref(), ctx.repo_token.as_deref());

    run_git(working_dir, &["remote", "add", "origin", &auth_url])
        .context("git remote add failed")?;

    run_git(working_dir, &["fetch", "origin", &ctx.commit_sha])
        .map_err(|e| GitError::Transient(e.context(format!(
            "git fetch origin {} failed",
            ctx.commit_sha
        ))))?;

    run_git(working_dir, &["checkout", &ctx.commit_sha])
        .context("git checkout failed")?;

    Ok(())
}

/// Construct an authenticated clone URL.
///
/// With both `REPO_USER` and `REPO_TOKEN` empty, the input URL is returned
/// byte-for-byte. With either set, the URL is parsed and `user:token@`
/// userinfo is injected ahead of the host.
pub fn auth_repo_url(repo_url: &str, repo_user: Option<&str>, repo_token: Option<&str>) -> String {
    let user = repo_user.unwrap_or("");
    let token = repo_token.unwrap_or("");

    if user.is_empty() && token.is_empty() {
        return repo_url.to_string();
    }

    match url::Url::parse(repo_url) {
        Ok(mut parsed) => {
            let _ = parsed.set_username(user);
            let _ = parsed.set_password(Some(token));
            parsed.to_string()
        }
        Err(_) => repo_url.to_string(),
    }
}

fn run_git(working_dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(working_dir)
        .output()
        .with_context(|| format!("failed to spawn git {:?}", args))?;

    if !output.status.success() {
        anyhow::bail!(
            "git {:?} exited with {:?}: {}",
            args,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(())
}

/// Absolute path to the default working directory the runner checks out into.
pub fn default_working_dir() -> PathBuf {
    PathBuf::from(".").join(REPO_ROOT)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// With both credential vars empty, the input URL comes back
        /// byte-for-byte, for any host/path shape.
        #[test]
        fn auth_url_unchanged_when_credentials_empty(
            host in "[a-z][a-z0-9-]{1,10}\\.[a-z]{2,5}",
            path in "[a-zA-Z0-9/_-]{0,20}",
        ) {
            let url = format!("https://{host}/{path}");
            prop_assert_eq!(auth_repo_url(&url, None, None), url);
        }

        #[test]
        fn auth_url_injects_userinfo_when_token_set(
            host in "[a-z][a-z0-9-]{1,10}\\.[a-z]{2,5}",
            user in "[a-zA-Z0-9]{1,12}",
            token in "[a-zA-Z0-9]{1,12}",
        ) {
            let url = format!("https://{host}/repo");
            let authed = auth_repo_url(&url, Some(&user), Some(&token));
            prop_assert!(authed.contains(&format!("{user}:{token}@{host}")));
        }
    }
}
