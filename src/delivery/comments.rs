//! Pull request bodies, audit comments, and the rebase counter marker.
//!
//! The counter lives in the PR body as an HTML comment so it survives
//! process restarts. A missing or unreadable marker counts as zero.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::PatchError;

static REBASE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*patchgate:rebase-attempts=(\d+)\s*-->")
        .expect("rebase marker pattern is a valid regex")
});

fn marker(attempts: u32) -> String {
    format!("<!-- patchgate:rebase-attempts={} -->", attempts)
}

/// Rebase attempts recorded in a PR body.
pub fn rebase_attempts(body: &str) -> u32 {
    REBASE_MARKER
        .captures(body)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

/// `body` with its counter set to `attempts`, appending a marker if absent.
pub fn with_rebase_attempts(body: &str, attempts: u32) -> String {
    if REBASE_MARKER.is_match(body) {
        REBASE_MARKER
            .replace(body, marker(attempts).as_str())
            .into_owned()
    } else if body.is_empty() {
        marker(attempts)
    } else {
        format!("{}\n\n{}", body.trim_end(), marker(attempts))
    }
}

pub fn pull_request_body(summary: Option<&str>, job_id: &str, diff_hash: &str) -> String {
    let mut body = String::new();
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        body.push_str(summary.trim());
        body.push_str("\n\n");
    }
    body.push_str("---\n");
    body.push_str("Verified in an isolated sandbox before this pull request was opened.\n\n");
    body.push_str(&format!("- Preview job: `{}`\n", job_id));
    body.push_str(&format!("- Verified diff SHA-256: `{}`\n\n", diff_hash));
    body.push_str(&marker(0));
    body
}

pub fn commit_message(summary: Option<&str>) -> String {
    format!("feat: automated safe edit\n\n{}", summary.unwrap_or("").trim())
}

pub fn ci_failure(checks_url: &str, failing: &[String], mergeable_state: Option<&str>) -> String {
    let mut out = String::from("### Automated Edit Blocked: CI Failure\n");
    out.push_str(
        "An automated edit for this pull request was refused because its current head is not in a mergeable state.\n\n",
    );
    for name in failing {
        out.push_str(&format!("- Failing check: `{}`\n", name));
    }
    if let Some(state) = mergeable_state {
        out.push_str(&format!("- Mergeable state: `{}`\n", state));
    }
    out.push_str("\n**Action Required:**\n");
    out.push_str("- Fix the failing checks, then re-trigger the edit.\n\n");
    out.push_str(&format!("[View Checks]({})", checks_url));
    out
}

pub fn rebase_success(branch: &str, attempts: u32, limit: u32) -> String {
    format!(
        "### Stale PR Rebased\n\
         The base branch had moved ahead, so this PR was rebased onto the latest default branch.\n\n\
         - Temporary branch created\n\
         - Diff re-applied successfully\n\
         - Force-pushed to `{}`\n\
         - Automated rebase attempts: {}/{}",
        branch, attempts, limit
    )
}

pub fn rebase_conflict(err: &PatchError) -> String {
    format!(
        "### Automated Rebase Failed\n\
         The verified diff no longer applies to the latest default branch.\n\n\
         `{}`\n\n\
         Manual resolution required.",
        err
    )
}

pub fn retry_limit(attempts: u32, limit: u32) -> String {
    format!(
        "### Retry Limit Exceeded\n\
         Automated rebase attempts: {}/{} exceeded.\n\
         Manual intervention required.",
        attempts, limit
    )
}
