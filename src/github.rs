//! # github: `RepositoryHost` over the GitHub REST API
//!
//! Repositories live under the account that owns the token. The login is fetched from
//! `/user` on first use and cached.
//!
//! `push_tree` records a whole tree as one commit through the git data API: one blob per
//! new file, one tree without a base (so paths not listed disappear), one commit and one
//! ref update. Repositories are created with `auto_init`, since the git data API refuses
//! to write blobs into a repository without commits; the first push then force-moves the
//! branch onto a root commit so the placeholder commit is not part of history.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::contract::{
    BlobSource, CommitInfo, FileMode, HostError, NewRepository, RemoteFile, RemoteTree,
    RepositoryHost, RepositoryMetadata, TreeCommit, TreeEntry, Visibility,
};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("repo-courier/", env!("CARGO_PKG_VERSION"));
const MEDIA_TYPE: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;
const BLOB_UPLOADS_IN_FLIGHT: usize = 4;
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Deserialize)]
struct ApiRepo {
    name: String,
    html_url: String,
    private: bool,
    default_branch: Option<String>,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    watchers_count: u64,
    #[serde(default)]
    size: u64,
    updated_at: Option<String>,
}

impl From<ApiRepo> for RepositoryMetadata {
    fn from(repo: ApiRepo) -> Self {
        RepositoryMetadata {
            name: repo.name,
            url: repo.html_url,
            visibility: Visibility::from_private(repo.private),
            default_branch: repo.default_branch.unwrap_or_else(|| "main".to_string()),
            description: repo.description,
            language: repo.language,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
            watchers: repo.watchers_count,
            size_kb: repo.size,
            updated_at: repo.updated_at,
        }
    }
}

#[derive(Serialize)]
struct CreateRepoBody<'a> {
    name: &'a str,
    description: &'a str,
    private: bool,
    auto_init: bool,
}

#[derive(Serialize)]
struct VisibilityBody {
    private: bool,
}

#[derive(Deserialize)]
struct ApiSha {
    sha: String,
}

#[derive(Deserialize)]
struct ApiRef {
    object: ApiSha,
}

#[derive(Deserialize)]
struct ApiTreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    mode: String,
}

#[derive(Deserialize)]
struct ApiTree {
    tree: Vec<ApiTreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Serialize)]
struct BlobBody {
    content: String,
    encoding: &'static str,
}

#[derive(Serialize)]
struct NewTreeItem<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: String,
}

#[derive(Serialize)]
struct NewTreeBody<'a> {
    tree: Vec<NewTreeItem<'a>>,
}

#[derive(Serialize)]
struct NewCommitBody<'a> {
    message: &'a str,
    tree: &'a str,
    parents: Vec<&'a str>,
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
    html_url: Option<String>,
}

#[derive(Serialize)]
struct UpdateRefBody<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Serialize)]
struct CreateRefBody<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

fn transport_error(e: reqwest::Error) -> HostError {
    if e.is_timeout() {
        HostError::Timeout
    } else {
        HostError::Transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, HostError> {
    resp.json::<T>()
        .await
        .map_err(|e| HostError::Decode(e.to_string()))
}

/// Map a non-success response onto [`HostError`]; `what` names the addressed resource.
async fn failure(resp: Response, what: &str) -> HostError {
    let status = resp.status();
    // A 403 with an exhausted quota is throttling, not a missing permission.
    let rate_limited = resp
        .headers()
        .get(RATE_LIMIT_REMAINING)
        .is_some_and(|remaining| remaining.as_bytes() == b"0");
    let message = match resp.json::<ApiMessage>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };
    match status {
        StatusCode::UNAUTHORIZED => HostError::BadCredentials(message),
        StatusCode::FORBIDDEN if !rate_limited => HostError::InsufficientScope(message),
        StatusCode::NOT_FOUND => HostError::NotFound(what.to_string()),
        other => HostError::Api {
            status: other.as_u16(),
            message,
        },
    }
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    login: OnceCell<String>,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_base", &self.api_base)
            .field("token_len", &self.token.len())
            .finish()
    }
}

impl GitHubClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HostError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::Transport(e.to_string()))?;
        let api_base = api_base.into().trim_end_matches('/').to_string();
        let token = token.into();
        info!(api_base = %api_base, token_len = token.len(), "[GITHUB] Client configured");
        Ok(Self {
            http,
            api_base,
            token,
            login: OnceCell::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header(ACCEPT, MEDIA_TYPE)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, HostError> {
        req.send().await.map_err(transport_error)
    }

    /// The account the token authenticates as.
    pub async fn login(&self) -> Result<String, HostError> {
        let login = self
            .login
            .get_or_try_init(|| async {
                let resp = self.send(self.request(Method::GET, "/user")).await?;
                if !resp.status().is_success() {
                    return Err(failure(resp, "authenticated user").await);
                }
                let user: ApiUser = decode(resp).await?;
                info!(login = %user.login, "[GITHUB] Authenticated");
                Ok(user.login)
            })
            .await?;
        Ok(login.clone())
    }

    async fn repo_path(&self, name: &str) -> Result<String, HostError> {
        Ok(format!("/repos/{}/{}", self.login().await?, name))
    }

    async fn upload_blob(&self, repo: &str, content: &[u8]) -> Result<String, HostError> {
        let body = BlobBody {
            content: BASE64.encode(content),
            encoding: "base64",
        };
        let resp = self
            .send(self.request(Method::POST, &format!("{repo}/git/blobs")).json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(failure(resp, "blob").await);
        }
        Ok(decode::<ApiSha>(resp).await?.sha)
    }

    async fn tree_item<'a>(
        &self,
        repo: &str,
        entry: &'a TreeEntry,
    ) -> Result<NewTreeItem<'a>, HostError> {
        let sha = match &entry.source {
            BlobSource::Existing(sha) => sha.clone(),
            BlobSource::Upload(content) => self.upload_blob(repo, content).await?,
        };
        Ok(NewTreeItem {
            path: &entry.path,
            mode: entry.mode.git_mode(),
            kind: "blob",
            sha,
        })
    }

    async fn move_branch(&self, repo: &str, branch: &str, sha: &str, force: bool) -> Result<(), HostError> {
        let resp = self
            .send(
                self.request(Method::PATCH, &format!("{repo}/git/refs/heads/{branch}"))
                    .json(&UpdateRefBody { sha, force }),
            )
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            // Branch does not exist yet.
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                debug!(branch, "[GITHUB] Creating branch ref");
                let body = CreateRefBody {
                    reference: format!("refs/heads/{branch}"),
                    sha,
                };
                let resp = self
                    .send(self.request(Method::POST, &format!("{repo}/git/refs")).json(&body))
                    .await?;
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(failure(resp, "branch").await)
                }
            }
            _ => Err(failure(resp, "branch").await),
        }
    }
}

#[async_trait]
impl RepositoryHost for GitHubClient {
    async fn get_repository(&self, name: &str) -> Result<Option<RepositoryMetadata>, HostError> {
        let path = self.repo_path(name).await?;
        let resp = self.send(self.request(Method::GET, &path)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(decode::<ApiRepo>(resp).await?.into())),
            _ => Err(failure(resp, name).await),
        }
    }

    async fn create_repository(&self, req: NewRepository) -> Result<RepositoryMetadata, HostError> {
        let body = CreateRepoBody {
            name: &req.name,
            description: &req.description,
            private: req.visibility.is_private(),
            auto_init: true,
        };
        let resp = self
            .send(self.request(Method::POST, "/user/repos").json(&body))
            .await?;
        match resp.status() {
            StatusCode::UNPROCESSABLE_ENTITY => {
                error!(repository = %req.name, "[GITHUB] Create rejected, name taken");
                Err(HostError::AlreadyExists(req.name))
            }
            s if s.is_success() => {
                let repo: ApiRepo = decode(resp).await?;
                info!(repository = %repo.name, url = %repo.html_url, "[GITHUB] Repository created");
                Ok(repo.into())
            }
            _ => Err(failure(resp, &req.name).await),
        }
    }

    async fn list_contents(&self, name: &str, branch: &str) -> Result<RemoteTree, HostError> {
        let repo = self.repo_path(name).await?;
        let resp = self
            .send(self.request(Method::GET, &format!("{repo}/git/ref/heads/{branch}")))
            .await?;
        match resp.status() {
            // Missing branch, or a repository without any commit.
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                debug!(repository = %name, branch, "[GITHUB] Branch has no commits");
                return Ok(RemoteTree::default());
            }
            s if !s.is_success() => return Err(failure(resp, name).await),
            _ => {}
        }
        let head = decode::<ApiRef>(resp).await?.object.sha;

        let resp = self
            .send(self.request(Method::GET, &format!("{repo}/git/trees/{head}?recursive=1")))
            .await?;
        if !resp.status().is_success() {
            return Err(failure(resp, name).await);
        }
        let tree: ApiTree = decode(resp).await?;
        if tree.truncated {
            return Err(HostError::Decode(format!(
                "tree listing of '{name}' was truncated by the API"
            )));
        }
        let files = tree
            .tree
            .into_iter()
            .filter(|item| item.kind == "blob")
            .map(|item| RemoteFile {
                mode: FileMode::from_git_mode(&item.mode),
                path: item.path,
                blob_id: item.sha,
            })
            .collect::<Vec<_>>();
        debug!(repository = %name, files = files.len(), head = %head, "[GITHUB] Listed branch contents");
        Ok(RemoteTree {
            head: Some(head),
            files,
        })
    }

    async fn push_tree(&self, name: &str, commit: TreeCommit) -> Result<CommitInfo, HostError> {
        let repo = self.repo_path(name).await?;

        // Order is preserved; at most BLOB_UPLOADS_IN_FLIGHT requests run at once.
        let pending: Vec<_> = commit
            .entries
            .iter()
            .map(|entry| self.tree_item(&repo, entry))
            .collect();
        let items: Vec<NewTreeItem> = stream::iter(pending)
            .buffered(BLOB_UPLOADS_IN_FLIGHT)
            .try_collect()
            .await?;
        let uploaded = commit
            .entries
            .iter()
            .filter(|e| matches!(e.source, BlobSource::Upload(_)))
            .count();
        debug!(repository = %name, uploaded, reused = items.len() - uploaded, "[GITHUB] Blobs ready");

        let resp = self
            .send(
                self.request(Method::POST, &format!("{repo}/git/trees"))
                    .json(&NewTreeBody { tree: items }),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(failure(resp, "tree").await);
        }
        let tree = decode::<ApiSha>(resp).await?.sha;

        let body = NewCommitBody {
            message: &commit.message,
            tree: &tree,
            parents: commit.parent.as_deref().into_iter().collect(),
        };
        let resp = self
            .send(self.request(Method::POST, &format!("{repo}/git/commits")).json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(failure(resp, "commit").await);
        }
        let created: ApiCommit = decode(resp).await?;

        self.move_branch(&repo, &commit.branch, &created.sha, commit.parent.is_none())
            .await?;
        info!(repository = %name, commit = %created.sha, branch = %commit.branch, "[GITHUB] Branch moved to new commit");

        Ok(CommitInfo {
            id: created.sha,
            url: created.html_url,
        })
    }

    async fn set_visibility(
        &self,
        name: &str,
        visibility: Visibility,
    ) -> Result<RepositoryMetadata, HostError> {
        let path = self.repo_path(name).await?;
        let body = VisibilityBody {
            private: visibility.is_private(),
        };
        let resp = self
            .send(self.request(Method::PATCH, &path).json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(failure(resp, name).await);
        }
        Ok(decode::<ApiRepo>(resp).await?.into())
    }

    async fn delete_repository(&self, name: &str) -> Result<(), HostError> {
        let path = self.repo_path(name).await?;
        let resp = self.send(self.request(Method::DELETE, &path)).await?;
        if resp.status().is_success() {
            info!(repository = %name, "[GITHUB] Repository deleted");
            Ok(())
        } else {
            Err(failure(resp, name).await)
        }
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryMetadata>, HostError> {
        let mut all = Vec::new();
        for page in 1.. {
            let path = format!(
                "/user/repos?per_page={PAGE_SIZE}&sort=updated&direction=desc&affiliation=owner&page={page}"
            );
            let resp = self.send(self.request(Method::GET, &path)).await?;
            if !resp.status().is_success() {
                return Err(failure(resp, "repositories").await);
            }
            let batch: Vec<ApiRepo> = decode(resp).await?;
            let last = batch.len() < PAGE_SIZE;
            all.extend(batch.into_iter().map(RepositoryMetadata::from));
            if last {
                break;
            }
        }
        Ok(all)
    }
}
