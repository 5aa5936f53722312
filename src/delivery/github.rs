//! `RepoHost` over the GitHub REST API.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::LINK;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::host::{
    CheckRun, FileCommit, HostConnector, NewPullRequest, PullRequest, RemoteFile, RepoHost, RepoMeta,
};
use crate::errors::HostError;
use crate::repo::RepoRef;

const USER_AGENT: &str = "patchgate";
const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: &str = "100";
/// Listing more than this many pages fails instead of returning a partial list.
const MAX_PAGES: usize = 50;

// --- wire types (subset of fields we care about) ---

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
    default_branch: String,
    permissions: Option<Permissions>,
}

#[derive(Debug, Deserialize)]
struct Permissions {
    push: bool,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContentRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    committer: CommitterBody<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CommitterBody<'a> {
    name: &'a str,
    email: &'a str,
}

impl<'a> PutContentRequest<'a> {
    fn for_commit(commit: &'a FileCommit) -> Self {
        Self {
            message: &commit.message,
            content: BASE64.encode(commit.content.as_bytes()),
            branch: &commit.branch,
            committer: CommitterBody {
                name: &commit.committer.name,
                email: &commit.committer.email,
            },
            sha: commit.write.sha(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PutContentResponse {
    commit: RefObject,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    title: String,
    body: Option<String>,
    html_url: String,
    head: PullBranch,
    base: PullBranch,
    #[serde(default)]
    draft: bool,
    mergeable_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullBranch {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

impl From<PullResponse> for PullRequest {
    fn from(p: PullResponse) -> Self {
        PullRequest {
            number: p.number,
            title: p.title,
            body: p.body.unwrap_or_default(),
            html_url: p.html_url,
            head_ref: p.head.git_ref,
            head_sha: p.head.sha,
            base_ref: p.base.git_ref,
            base_sha: p.base.sha,
            draft: p.draft,
            mergeable_state: p.mergeable_state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRunResponse>,
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Decode a contents-API body. GitHub wraps base64 at 60 columns.
fn decode_content(content: &str) -> Result<String, String> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64.decode(compact).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| format!("file is not UTF-8: {}", e))
}

/// Target of the `rel="next"` entry in a `Link` header, if any.
fn next_link(header: &str) -> Option<Url> {
    header.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == "rel=\"next\"") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Url::parse(target).ok()
    })
}

/// GitHub client bound to one bearer token.
pub struct GitHubHost {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubHost {
    pub fn new(client: reqwest::Client, api_base: &str, token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// `{api_base}/repos/{owner}/{repo}/{tail...}` with each segment escaped.
    fn repo_url(&self, repo: &RepoRef, tail: &[&str]) -> Result<Url, HostError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| HostError::Transport {
            operation: "build url".into(),
            message: e.to_string(),
        })?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| HostError::Transport {
                operation: "build url".into(),
                message: format!("{} cannot be a base URL", self.api_base),
            })?;
            segments.pop_if_empty();
            segments.extend(["repos", repo.owner.as_str(), repo.name.as_str()]);
            segments.extend(tail.iter().flat_map(|s| s.split('/')));
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response, HostError> {
        let resp = builder.send().await.map_err(|e| HostError::Transport {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(text);
        tracing::debug!(operation, status = status.as_u16(), %message, "github request failed");
        Err(HostError::Api {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T, HostError> {
        let resp = self.send(operation, builder).await?;
        decode(operation, resp).await
    }

    /// GET every page of a list endpoint, following `Link: rel="next"`.
    async fn get_all<P, T>(
        &self,
        operation: &str,
        mut url: Url,
        items: impl Fn(P) -> Vec<T>,
    ) -> Result<Vec<T>, HostError>
    where
        P: DeserializeOwned,
    {
        url.query_pairs_mut().append_pair("per_page", PAGE_SIZE);
        let mut all = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;
        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(HostError::Decode {
                    operation: operation.to_string(),
                    message: format!("more than {} pages of results", MAX_PAGES),
                });
            }
            let resp = self.send(operation, self.request(Method::GET, url)).await?;
            next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let page: P = decode(operation, resp).await?;
            all.extend(items(page));
        }
        Ok(all)
    }
}

async fn decode<T: DeserializeOwned>(operation: &str, resp: Response) -> Result<T, HostError> {
    resp.json::<T>().await.map_err(|e| HostError::Decode {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl RepoHost for GitHubHost {
    async fn repository(&self, repo: &RepoRef) -> Result<RepoMeta, HostError> {
        let url = self.repo_url(repo, &[])?;
        let resp: RepoResponse = self
            .send_json("get repository", self.request(Method::GET, url))
            .await?;
        Ok(RepoMeta {
            full_name: resp.full_name,
            default_branch: resp.default_branch,
            can_push: resp.permissions.map(|p| p.push),
        })
    }

    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<String, HostError> {
        let url = self.repo_url(repo, &["git", "ref", "heads", branch])?;
        let resp: RefResponse = self
            .send_json("get ref", self.request(Method::GET, url))
            .await?;
        Ok(resp.object.sha)
    }

    async fn create_branch(&self, repo: &RepoRef, branch: &str, sha: &str) -> Result<(), HostError> {
        let url = self.repo_url(repo, &["git", "refs"])?;
        let body = serde_json::json!({ "ref": format!("refs/heads/{}", branch), "sha": sha });
        self.send("create ref", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(())
    }

    async fn update_branch(
        &self,
        repo: &RepoRef,
        branch: &str,
        sha: &str,
        force: bool,
    ) -> Result<(), HostError> {
        let url = self.repo_url(repo, &["git", "refs", "heads", branch])?;
        let body = serde_json::json!({ "sha": sha, "force": force });
        self.send("update ref", self.request(Method::PATCH, url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, branch: &str) -> Result<(), HostError> {
        let url = self.repo_url(repo, &["git", "refs", "heads", branch])?;
        self.send("delete ref", self.request(Method::DELETE, url))
            .await?;
        Ok(())
    }

    async fn file(
        &self,
        repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<RemoteFile>, HostError> {
        let url = self.repo_url(repo, &["contents", path])?;
        let builder = self
            .request(Method::GET, url)
            .query(&[("ref", git_ref)]);
        let resp: ContentResponse = match self.send_json("get contents", builder).await {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Some(encoding) = resp.encoding.as_deref().filter(|e| *e != "base64") {
            return Err(HostError::Decode {
                operation: "get contents".into(),
                message: format!("unsupported content encoding '{}'", encoding),
            });
        }
        let content = decode_content(&resp.content).map_err(|message| HostError::Decode {
            operation: "get contents".into(),
            message,
        })?;
        Ok(Some(RemoteFile {
            content,
            sha: resp.sha,
        }))
    }

    async fn commit_file(&self, repo: &RepoRef, commit: &FileCommit) -> Result<String, HostError> {
        let url = self.repo_url(repo, &["contents", &commit.path])?;
        let body = PutContentRequest::for_commit(commit);
        let resp: PutContentResponse = self
            .send_json("put contents", self.request(Method::PUT, url).json(&body))
            .await?;
        Ok(resp.commit.sha)
    }

    async fn open_pull_requests(&self, repo: &RepoRef) -> Result<Vec<PullRequest>, HostError> {
        let mut url = self.repo_url(repo, &["pulls"])?;
        url.query_pairs_mut().append_pair("state", "open");
        self.get_all("list pulls", url, |page: Vec<PullResponse>| {
            page.into_iter().map(PullRequest::from).collect()
        })
        .await
    }

    async fn pull_request(&self, repo: &RepoRef, number: u64) -> Result<PullRequest, HostError> {
        let url = self.repo_url(repo, &["pulls", &number.to_string()])?;
        let pr: PullResponse = self
            .send_json("get pull", self.request(Method::GET, url))
            .await?;
        Ok(pr.into())
    }

    async fn create_pull_request(
        &self,
        repo: &RepoRef,
        pr: &NewPullRequest,
    ) -> Result<PullRequest, HostError> {
        let url = self.repo_url(repo, &["pulls"])?;
        let body = serde_json::json!({
            "title": pr.title,
            "body": pr.body,
            "head": pr.head,
            "base": pr.base,
        });
        let created: PullResponse = self
            .send_json("create pull", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(created.into())
    }

    async fn update_pull_request_body(
        &self,
        repo: &RepoRef,
        number: u64,
        body: &str,
    ) -> Result<(), HostError> {
        let url = self.repo_url(repo, &["pulls", &number.to_string()])?;
        let body = serde_json::json!({ "body": body });
        self.send("update pull", self.request(Method::PATCH, url).json(&body))
            .await?;
        Ok(())
    }

    async fn comment(&self, repo: &RepoRef, number: u64, body: &str) -> Result<(), HostError> {
        let url = self.repo_url(repo, &["issues", &number.to_string(), "comments"])?;
        let body = serde_json::json!({ "body": body });
        self.send("create comment", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(())
    }

    async fn add_labels(&self, repo: &RepoRef, number: u64, labels: &[String]) -> Result<(), HostError> {
        if labels.is_empty() {
            return Ok(());
        }
        let url = self.repo_url(repo, &["issues", &number.to_string(), "labels"])?;
        let body = serde_json::json!({ "labels": labels });
        self.send("add labels", self.request(Method::POST, url).json(&body))
            .await?;
        Ok(())
    }

    async fn check_runs(&self, repo: &RepoRef, sha: &str) -> Result<Vec<CheckRun>, HostError> {
        let url = self.repo_url(repo, &["commits", sha, "check-runs"])?;
        self.get_all("list check runs", url, |page: CheckRunsResponse| {
            page.check_runs
                .into_iter()
                .map(|c| CheckRun {
                    name: c.name,
                    status: c.status,
                    conclusion: c.conclusion,
                })
                .collect()
        })
        .await
    }
}

/// Hands out `GitHubHost` clients sharing one connection pool.
pub struct GitHubConnector {
    client: reqwest::Client,
    api_base: String,
}

impl GitHubConnector {
    pub fn new(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
        }
    }
}

impl HostConnector for GitHubConnector {
    fn connect(&self, token: &str) -> Arc<dyn RepoHost> {
        Arc::new(GitHubHost::new(self.client.clone(), &self.api_base, token))
    }
}
