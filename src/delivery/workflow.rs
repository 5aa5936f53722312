//! Pull request workflow: open, rebase, gate on CI, or append.
//!
//! One PR per target file, found by its title. A PR whose recorded base no
//! longer matches the default branch head is rebased (bounded by the
//! counter in its body); otherwise its CI state decides whether a new
//! commit may be appended.

use serde::Serialize;

use super::comments;
use super::host::{
    Committer, FileCommit, FileWrite, NewPullRequest, PullRequest, RemoteFile, RepoHost,
};
use crate::config::DeliveryConfig;
use crate::errors::{DeliveryError, HostError};
use crate::patch;
use crate::repo::RepoRef;
use crate::safety;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    New,
    Rebase,
    Cumulative,
}

/// Prior blob of the edited file, for reverting a new PR by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rollback {
    pub file: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub pr_url: String,
    pub branch: String,
    pub mode: DeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<Rollback>,
}

/// A gate-approved edit.
#[derive(Debug, Clone)]
pub struct VerifiedEdit<'a> {
    pub repo: &'a RepoRef,
    pub job_id: &'a str,
    pub target_file: &'a str,
    pub diff: &'a str,
    pub diff_hash: &'a str,
    pub summary: Option<&'a str>,
}

pub struct PrWorkflow<'a> {
    host: &'a dyn RepoHost,
    config: &'a DeliveryConfig,
}

/// `package.json` -> `package-json`.
pub fn sanitize_file_name(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl<'a> PrWorkflow<'a> {
    pub fn new(host: &'a dyn RepoHost, config: &'a DeliveryConfig) -> Self {
        Self { host, config }
    }

    fn title(&self, target_file: &str) -> String {
        format!("{}: {}", self.config.title_prefix, target_file)
    }

    fn committer(&self) -> Committer {
        Committer {
            name: self.config.committer_name.clone(),
            email: self.config.committer_email.clone(),
        }
    }

    fn host_err(edit: &VerifiedEdit<'_>) -> impl Fn(HostError) -> DeliveryError {
        let repo = edit.repo.to_string();
        move |e| DeliveryError::from_host(e, &repo, false)
    }

    pub async fn execute(&self, edit: &VerifiedEdit<'_>) -> Result<ApplyOutcome, DeliveryError> {
        let verdict = safety::check(edit.target_file, edit.diff);
        if !verdict.safe {
            return Err(DeliveryError::UnsafePatch(
                verdict.reason.unwrap_or_default(),
            ));
        }

        let repo = edit.repo;
        let meta = self
            .host
            .repository(repo)
            .await
            .map_err(|e| DeliveryError::from_host(e, &repo.to_string(), true))?;
        if meta.can_push == Some(false) {
            return Err(DeliveryError::PermissionDenied(format!(
                "credential cannot push to {}",
                repo
            )));
        }

        let head = self
            .host
            .branch_head(repo, &meta.default_branch)
            .await
            .map_err(Self::host_err(edit))?;

        let title = self.title(edit.target_file);
        let existing = self
            .host
            .open_pull_requests(repo)
            .await
            .map_err(Self::host_err(edit))?
            .into_iter()
            .find(|pr| pr.title == title);

        match existing {
            None => self.open_new(edit, &meta.default_branch, &head, title).await,
            Some(pr) if pr.base_sha != head => self.rebase(edit, &pr, &head).await,
            Some(pr) => {
                self.ensure_mergeable(edit, &pr).await?;
                self.append(edit, &pr).await
            }
        }
    }

    /// Apply the diff to `original`, refusing results identical to the input.
    fn patched(edit: &VerifiedEdit<'_>, original: Option<&RemoteFile>) -> Result<String, DeliveryError> {
        let before = original.map(|f| f.content.as_str()).unwrap_or("");
        let after = patch::apply(before, edit.diff)?;
        if after == before {
            return Err(DeliveryError::NoOpPatch {
                file: edit.target_file.to_string(),
            });
        }
        Ok(after)
    }

    fn commit(&self, edit: &VerifiedEdit<'_>, branch: &str, content: String, write: FileWrite) -> FileCommit {
        FileCommit {
            path: edit.target_file.to_string(),
            branch: branch.to_string(),
            message: comments::commit_message(edit.summary),
            content,
            write,
            committer: self.committer(),
        }
    }

    async fn open_new(
        &self,
        edit: &VerifiedEdit<'_>,
        default_branch: &str,
        head: &str,
        title: String,
    ) -> Result<ApplyOutcome, DeliveryError> {
        let repo = edit.repo;
        let original = self
            .host
            .file(repo, edit.target_file, head)
            .await
            .map_err(Self::host_err(edit))?;
        let content = Self::patched(edit, original.as_ref())?;

        let branch = format!(
            "{}/edit-{}-{}",
            self.config.branch_prefix,
            sanitize_file_name(edit.target_file),
            now_millis()
        );
        self.host
            .create_branch(repo, &branch, head)
            .await
            .map_err(Self::host_err(edit))?;

        let commit = self.commit(edit, &branch, content, FileWrite::for_existing(original.as_ref()));
        self.host
            .commit_file(repo, &commit)
            .await
            .map_err(Self::host_err(edit))?;

        let pr = self
            .host
            .create_pull_request(
                repo,
                &NewPullRequest {
                    title,
                    body: comments::pull_request_body(edit.summary, edit.job_id, edit.diff_hash),
                    head: branch.clone(),
                    base: default_branch.to_string(),
                },
            )
            .await
            .map_err(Self::host_err(edit))?;

        // the PR exists at this point; a labeling failure does not undo it
        if let Err(e) = self
            .host
            .add_labels(repo, pr.number, &self.config.labels)
            .await
        {
            tracing::warn!(pr = pr.number, error = %e, "failed to label pull request");
        }

        tracing::info!(repo = %repo, file = edit.target_file, pr = pr.number, branch = %branch, "opened pull request");
        Ok(ApplyOutcome {
            pr_url: pr.html_url,
            branch,
            mode: DeliveryMode::New,
            rollback: original.map(|f| Rollback {
                file: edit.target_file.to_string(),
                sha: f.sha,
            }),
        })
    }

    /// Re-apply the diff on the new default-branch head and force-push it
    /// onto the PR branch.
    async fn rebase(
        &self,
        edit: &VerifiedEdit<'_>,
        pr: &PullRequest,
        head: &str,
    ) -> Result<ApplyOutcome, DeliveryError> {
        let repo = edit.repo;
        let limit = self.config.max_rebase_attempts;
        let attempts = comments::rebase_attempts(&pr.body);
        tracing::info!(repo = %repo, pr = pr.number, attempts, limit, "pull request is stale");

        if attempts >= limit {
            self.post(edit, pr.number, &comments::retry_limit(attempts, limit)).await;
            return Err(DeliveryError::RetryLimitReached {
                pr: pr.number,
                attempts,
                limit,
            });
        }

        let temp = format!(
            "{}/rebase-{}-{}",
            self.config.branch_prefix,
            pr.number,
            now_millis()
        );
        self.host
            .create_branch(repo, &temp, head)
            .await
            .map_err(Self::host_err(edit))?;

        let result = self.rebase_onto(edit, pr, &temp).await;

        if let Err(e) = self.host.delete_branch(repo, &temp).await {
            tracing::warn!(pr = pr.number, branch = %temp, error = %e, "failed to delete temporary branch");
        }
        result?;

        let attempts = attempts + 1;
        self.host
            .update_pull_request_body(repo, pr.number, &comments::with_rebase_attempts(&pr.body, attempts))
            .await
            .map_err(Self::host_err(edit))?;
        self.post(
            edit,
            pr.number,
            &comments::rebase_success(&pr.head_ref, attempts, limit),
        )
        .await;

        tracing::info!(repo = %repo, pr = pr.number, attempts, "rebased stale pull request");
        Ok(ApplyOutcome {
            pr_url: pr.html_url.clone(),
            branch: pr.head_ref.clone(),
            mode: DeliveryMode::Rebase,
            rollback: None,
        })
    }

    async fn rebase_onto(
        &self,
        edit: &VerifiedEdit<'_>,
        pr: &PullRequest,
        temp: &str,
    ) -> Result<(), DeliveryError> {
        let repo = edit.repo;
        let original = self
            .host
            .file(repo, edit.target_file, temp)
            .await
            .map_err(Self::host_err(edit))?;

        let content = match Self::patched(edit, original.as_ref()) {
            Ok(content) => content,
            Err(DeliveryError::Patch(source)) => {
                tracing::warn!(pr = pr.number, error = %source, "rebase conflict");
                self.post(edit, pr.number, &comments::rebase_conflict(&source)).await;
                return Err(DeliveryError::RebaseConflict {
                    pr: pr.number,
                    source,
                });
            }
            Err(e) => return Err(e),
        };

        let commit = self.commit(edit, temp, content, FileWrite::for_existing(original.as_ref()));
        let sha = self
            .host
            .commit_file(repo, &commit)
            .await
            .map_err(Self::host_err(edit))?;
        self.host
            .update_branch(repo, &pr.head_ref, &sha, true)
            .await
            .map_err(Self::host_err(edit))
    }

    /// Refuse to touch a PR whose checks fail or whose state blocks merging.
    async fn ensure_mergeable(&self, edit: &VerifiedEdit<'_>, pr: &PullRequest) -> Result<(), DeliveryError> {
        let repo = edit.repo;
        let current = self
            .host
            .pull_request(repo, pr.number)
            .await
            .map_err(Self::host_err(edit))?;
        let failing: Vec<String> = self
            .host
            .check_runs(repo, &current.head_sha)
            .await
            .map_err(Self::host_err(edit))?
            .into_iter()
            .filter(|c| c.is_failing())
            .map(|c| c.name)
            .collect();

        let blocked_state = current
            .mergeable_state
            .as_deref()
            .filter(|s| matches!(*s, "draft" | "dirty" | "blocked"))
            .or(current.draft.then_some("draft"));

        if failing.is_empty() && blocked_state.is_none() {
            return Ok(());
        }

        let mut reasons = Vec::new();
        if !failing.is_empty() {
            reasons.push(format!("failing checks: {}", failing.join(", ")));
        }
        if let Some(state) = blocked_state {
            reasons.push(format!("mergeable state is {}", state));
        }
        let message = format!("{}; fix CI before re-triggering the edit", reasons.join("; "));
        tracing::warn!(repo = %repo, pr = pr.number, %message, "pull request blocked");

        let checks_url = format!("{}/checks", current.html_url);
        self.post(edit, pr.number, &comments::ci_failure(&checks_url, &failing, blocked_state))
            .await;
        Err(DeliveryError::BlockedByCi {
            pr: pr.number,
            message,
        })
    }

    /// Cumulative mode: one more commit on the existing PR branch.
    async fn append(&self, edit: &VerifiedEdit<'_>, pr: &PullRequest) -> Result<ApplyOutcome, DeliveryError> {
        let repo = edit.repo;
        let original = self
            .host
            .file(repo, edit.target_file, &pr.head_ref)
            .await
            .map_err(Self::host_err(edit))?;
        let content = Self::patched(edit, original.as_ref())?;

        let commit = self.commit(edit, &pr.head_ref, content, FileWrite::for_existing(original.as_ref()));
        self.host
            .commit_file(repo, &commit)
            .await
            .map_err(Self::host_err(edit))?;

        tracing::info!(repo = %repo, pr = pr.number, "appended commit to existing pull request");
        Ok(ApplyOutcome {
            pr_url: pr.html_url.clone(),
            branch: pr.head_ref.clone(),
            mode: DeliveryMode::Cumulative,
            rollback: None,
        })
    }

    /// Audit comments are best effort; the outcome is already decided.
    async fn post(&self, edit: &VerifiedEdit<'_>, number: u64, body: &str) {
        if let Err(e) = self.host.comment(edit.repo, number, body).await {
            tracing::warn!(pr = number, error = %e, "failed to post comment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::host::CheckRun;
    use crate::delivery::host::mock::MockHost;
    use crate::token::hash_diff;

    const PACKAGE_JSON: &str = "{\n  \"scripts\": {\n    \"build\": \"tsc\"\n  }\n}\n";
    const DIFF: &str = "--- a/package.json\n+++ b/package.json\n@@ -1,3 +1,4 @@\n {\n   \"scripts\": {\n+    \"lint\": \"eslint .\",\n     \"build\": \"tsc\"\n";

    fn repo() -> RepoRef {
        RepoRef::parse("acme/app").unwrap()
    }

    async fn run(host: &MockHost, diff: &str) -> Result<ApplyOutcome, DeliveryError> {
        let config = DeliveryConfig::default();
        let repo = repo();
        let hash = hash_diff(diff);
        let edit = VerifiedEdit {
            repo: &repo,
            job_id: "job-1",
            target_file: "package.json",
            diff,
            diff_hash: &hash,
            summary: Some("Add a lint script"),
        };
        PrWorkflow::new(host, &config).execute(&edit).await
    }

    #[tokio::test]
    async fn test_new_pull_request() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        let outcome = run(&host, DIFF).await.unwrap();

        assert_eq!(outcome.mode, DeliveryMode::New);
        assert!(outcome.branch.starts_with("patchgate/edit-package-json-"));
        assert_eq!(outcome.pr_url, "https://github.com/acme/app/pull/1");
        let rollback = outcome.rollback.unwrap();
        assert_eq!(rollback.file, "package.json");

        let content = host.file_on(&outcome.branch, "package.json").unwrap();
        assert!(content.contains("\"lint\": \"eslint .\""));
        assert_eq!(host.file_on("main", "package.json").unwrap(), PACKAGE_JSON);

        let state = host.state();
        let pr = &state.pulls[0];
        assert_eq!(pr.title, "Patchgate Safe Edit: package.json");
        assert!(pr.body.contains(&hash_diff(DIFF)));
        assert_eq!(comments::rebase_attempts(&pr.body), 0);
        assert_eq!(state.labels[&1], vec!["automated-edit", "sandbox-verified"]);
        assert!(state.commit_messages[0].starts_with("feat: automated safe edit\n\nAdd a lint script"));
    }

    #[tokio::test]
    async fn test_new_file_has_no_rollback() {
        let host = MockHost::with_files(&[("README.md", "hi\n")]);
        let diff = "--- /dev/null\n+++ b/package.json\n@@ -0,0 +1,1 @@\n+{}\n";
        let outcome = run(&host, diff).await.unwrap();
        assert_eq!(outcome.mode, DeliveryMode::New);
        assert!(outcome.rollback.is_none());
        assert!(host.file_on(&outcome.branch, "package.json").unwrap().starts_with("{}"));
    }

    #[tokio::test]
    async fn test_patch_failure_writes_nothing() {
        let host = MockHost::with_files(&[("package.json", "something else\n")]);
        let err = run(&host, DIFF).await.unwrap_err();
        assert_eq!(err.reason(), "patch_failed");
        let state = host.state();
        assert_eq!(state.branches.len(), 1);
        assert!(state.pulls.is_empty());
    }

    #[tokio::test]
    async fn test_missing_repository_and_permission() {
        let host = MockHost::with_files(&[]);
        host.state().meta = None;
        assert_eq!(run(&host, DIFF).await.unwrap_err().reason(), "repository_not_found");

        let host = MockHost::with_files(&[]);
        host.state().repository_status = Some(403);
        assert_eq!(run(&host, DIFF).await.unwrap_err().reason(), "permission_denied");

        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        host.state().meta.as_mut().unwrap().can_push = Some(false);
        assert_eq!(run(&host, DIFF).await.unwrap_err().reason(), "permission_denied");
    }

    #[tokio::test]
    async fn test_unsafe_patch_rejected_before_any_call() {
        let host = MockHost::with_files(&[]);
        host.state().meta = None;
        let diff = format!("@@ -1 +1,202 @@\n{}", "+x\n".repeat(201));
        assert_eq!(run(&host, &diff).await.unwrap_err().reason(), "unsafe_patch");
    }

    #[tokio::test]
    async fn test_stale_pull_request_is_rebased() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON), ("README.md", "v1\n")]);
        let first = run(&host, DIFF).await.unwrap();
        let new_head = host.advance_main("README.md", "v2\n");

        let outcome = run(&host, DIFF).await.unwrap();
        assert_eq!(outcome.mode, DeliveryMode::Rebase);
        assert_eq!(outcome.branch, first.branch);
        assert_eq!(outcome.pr_url, first.pr_url);

        let state = host.state();
        assert_eq!(state.pulls.len(), 1);
        assert_eq!(comments::rebase_attempts(&state.pulls[0].body), 1);
        assert!(state.comments.iter().any(|(n, c)| *n == 1 && c.contains("1/3")));
        assert_eq!(state.deleted_branches.len(), 1);
        assert!(state.deleted_branches[0].starts_with("patchgate/rebase-1-"));
        assert!(!state.branches.contains_key(&state.deleted_branches[0]));

        // the PR branch now sits on the new head and carries the edit
        let pr_head = &state.branches[&first.branch];
        let tree = &state.commits[pr_head];
        assert_eq!(tree["README.md"].content, "v2\n");
        assert!(tree["package.json"].content.contains("lint"));
        assert_eq!(state.pulls[0].base_sha, new_head);
    }

    #[tokio::test]
    async fn test_rebase_limit_is_enforced() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON), ("README.md", "v1\n")]);
        run(&host, DIFF).await.unwrap();
        {
            let mut state = host.state();
            let body = comments::with_rebase_attempts(&state.pulls[0].body, 3);
            state.pulls[0].body = body;
        }
        host.advance_main("README.md", "v2\n");
        let branches_before = host.state().branches.len();

        let err = run(&host, DIFF).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::RetryLimitReached {
                pr: 1,
                attempts: 3,
                limit: 3
            }
        ));
        let state = host.state();
        assert_eq!(state.branches.len(), branches_before);
        assert!(state.comments.iter().any(|(_, c)| c.contains("3/3 exceeded")));
    }

    #[tokio::test]
    async fn test_rebase_conflict_comments_and_cleans_up() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        run(&host, DIFF).await.unwrap();
        host.advance_main("package.json", "{\n  \"name\": \"rewritten\"\n}\n");

        let err = run(&host, DIFF).await.unwrap_err();
        assert_eq!(err.reason(), "rebase_conflict");
        let state = host.state();
        assert!(state.comments.iter().any(|(_, c)| c.contains("Automated Rebase Failed")));
        assert_eq!(state.deleted_branches.len(), 1);
        assert_eq!(comments::rebase_attempts(&state.pulls[0].body), 0);
    }

    #[tokio::test]
    async fn test_failing_ci_blocks_cumulative_edit() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        run(&host, DIFF).await.unwrap();
        {
            let mut state = host.state();
            let head = state.pulls[0].head_sha.clone();
            state.checks.insert(
                head,
                vec![CheckRun {
                    name: "build".into(),
                    status: "completed".into(),
                    conclusion: Some("failure".into()),
                }],
            );
        }
        let err = run(&host, DIFF).await.unwrap_err();
        assert_eq!(err.reason(), "blocked_by_ci");
        assert!(err.to_string().contains("build"));
        assert!(host.state().comments.iter().any(|(_, c)| c.contains("CI Failure")));
    }

    #[tokio::test]
    async fn test_dirty_mergeable_state_blocks() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        run(&host, DIFF).await.unwrap();
        host.state().mergeable_state.insert(1, "dirty".into());
        let err = run(&host, DIFF).await.unwrap_err();
        assert!(matches!(err, DeliveryError::BlockedByCi { pr: 1, .. }));
    }

    #[tokio::test]
    async fn test_clean_pull_request_gets_cumulative_commit() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        let first = run(&host, DIFF).await.unwrap();
        let second_diff = "--- a/package.json\n+++ b/package.json\n@@ -3,3 +3,4 @@\n     \"lint\": \"eslint .\",\n     \"build\": \"tsc\"\n+    ,\"test\": \"jest\"\n   }\n";

        let outcome = run(&host, second_diff).await.unwrap();
        assert_eq!(outcome.mode, DeliveryMode::Cumulative);
        assert_eq!(outcome.branch, first.branch);
        let content = host.file_on(&first.branch, "package.json").unwrap();
        assert!(content.contains("lint"));
        assert!(content.contains("jest"));
        assert_eq!(host.state().pulls.len(), 1);
    }

    #[tokio::test]
    async fn test_no_op_patch_is_rejected() {
        let host = MockHost::with_files(&[("package.json", PACKAGE_JSON)]);
        let diff = "--- a/package.json\n+++ b/package.json\n@@ -1,2 +1,2 @@\n {\n   \"scripts\": {\n";
        let err = run(&host, diff).await.unwrap_err();
        assert_eq!(err.reason(), "no_op_patch");
        assert!(host.state().pulls.is_empty());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("src/app/page.tsx"), "src-app-page-tsx");
    }
}
