//! Repository host abstraction used by the delivery workflow.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::HostError;
use crate::repo::RepoRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoMeta {
    pub full_name: String,
    pub default_branch: String,
    /// `None` when the host did not report permissions for this credential.
    pub can_push: Option<bool>,
}

/// A file read at some ref: decoded content plus its blob sha.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: String,
    pub sha: String,
}

/// How a file write relates to the existing blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileWrite {
    /// The file does not exist yet.
    Create,
    /// Replace the blob with this sha.
    Update { sha: String },
}

impl FileWrite {
    pub fn for_existing(file: Option<&RemoteFile>) -> Self {
        match file {
            Some(f) => FileWrite::Update { sha: f.sha.clone() },
            None => FileWrite::Create,
        }
    }

    pub fn sha(&self) -> Option<&str> {
        match self {
            FileWrite::Create => None,
            FileWrite::Update { sha } => Some(sha),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

/// A whole-file commit onto a branch.
#[derive(Debug, Clone)]
pub struct FileCommit {
    pub path: String,
    pub branch: String,
    pub message: String,
    pub content: String,
    pub write: FileWrite,
    pub committer: Committer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub html_url: String,
    pub head_ref: String,
    pub head_sha: String,
    pub base_ref: String,
    pub base_sha: String,
    pub draft: bool,
    /// Only populated by `pull_request`, not by listings.
    pub mergeable_state: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

impl CheckRun {
    pub fn is_failing(&self) -> bool {
        matches!(
            self.conclusion.as_deref(),
            Some("failure") | Some("cancelled") | Some("timed_out")
        )
    }
}

/// Remote repository operations, bound to one credential.
#[async_trait]
pub trait RepoHost: Send + Sync {
    async fn repository(&self, repo: &RepoRef) -> Result<RepoMeta, HostError>;

    /// Commit sha at the head of `branch`.
    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<String, HostError>;

    async fn create_branch(&self, repo: &RepoRef, branch: &str, sha: &str) -> Result<(), HostError>;

    /// Move `branch` to `sha`, discarding its history when `force` is set.
    async fn update_branch(
        &self,
        repo: &RepoRef,
        branch: &str,
        sha: &str,
        force: bool,
    ) -> Result<(), HostError>;

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> Result<(), HostError>;

    /// File contents at `git_ref` (branch name or commit sha); `None` if absent.
    async fn file(
        &self,
        repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<RemoteFile>, HostError>;

    /// Write a whole file and return the new commit sha.
    async fn commit_file(&self, repo: &RepoRef, commit: &FileCommit) -> Result<String, HostError>;

    async fn open_pull_requests(&self, repo: &RepoRef) -> Result<Vec<PullRequest>, HostError>;

    async fn pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequest, HostError>;

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, HostError>;

    async fn update_pull_request_body(
        &self,
        repo: &RepoRef,
        number: u64,
        body: &str,
    ) -> Result<(), HostError>;

    async fn comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<(), HostError>;

    async fn add_labels(&self, repo: &RepoRef, number: u64, labels: &[String]) -> Result<(), HostError>;

    async fn check_runs(&self, repo: &RepoRef, sha: &str) -> Result<Vec<CheckRun>, HostError>;
}

/// Builds a host client bound to a freshly negotiated credential.
pub trait HostConnector: Send + Sync {
    fn connect(&self, token: &str) -> Arc<dyn RepoHost>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_write_variant_follows_existing_blob() {
        assert_eq!(FileWrite::for_existing(None), FileWrite::Create);
        let existing = RemoteFile {
            content: "x".into(),
            sha: "abc".into(),
        };
        let write = FileWrite::for_existing(Some(&existing));
        assert_eq!(write.sha(), Some("abc"));
        assert_eq!(FileWrite::Create.sha(), None);
    }

    #[test]
    fn test_failing_check_conclusions() {
        let run = |conclusion: Option<&str>| CheckRun {
            name: "ci".into(),
            status: "completed".into(),
            conclusion: conclusion.map(String::from),
        };
        assert!(run(Some("failure")).is_failing());
        assert!(run(Some("cancelled")).is_failing());
        assert!(run(Some("timed_out")).is_failing());
        assert!(!run(Some("success")).is_failing());
        assert!(!run(Some("neutral")).is_failing());
        assert!(!run(None).is_failing());
    }
}
