//! Repository synchronisation: map a file tree plus description document onto remote
//! create/update/visibility/delete operations.
//!
//! Every remote call is bounded by a per-call timeout and never retried. A failure after
//! the first mutation is reported with the remote state it left behind.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::contract::{
    BlobSource, CommitInfo, HostError, NewRepository, RemoteFile, RemoteTree, RepositoryHost,
    RepositoryMetadata, TreeCommit, TreeEntry, Visibility,
};
use crate::describe::DescriptionDocument;
use crate::tree::FileTree;

pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
pub const REPOSITORY_DESCRIPTION: &str = "Published with repo-courier";
/// Number of repositories listed in the account overview.
pub const OVERVIEW_RECENT: usize = 5;

/// Content left in a remote repository after a partially applied mutation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PartialFailure {
    #[error(
        "repository '{name}' was created at {url} but the files were not pushed ({cause}); \
         send the archive again with update_repo {name}, or delete the repository"
    )]
    CreatedButNotPushed {
        name: String,
        url: String,
        cause: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("repository '{0}' already exists; use update_repo to replace its content")]
    AlreadyExists(String),

    #[error("repository '{0}' not found")]
    NotFound(String),

    #[error("the hosting credential may not {operation} '{name}': {detail}")]
    InsufficientScope {
        operation: &'static str,
        name: String,
        detail: String,
    },

    #[error("{operation} timed out after {}s; nothing was retried", .timeout.as_secs())]
    RemoteTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    PartialFailure(#[from] PartialFailure),

    #[error("{operation} failed: {source}")]
    Remote {
        operation: &'static str,
        #[source]
        source: HostError,
    },
}

/// Path-level changes between an incoming tree and the remote branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    /// Nothing had to change remotely.
    NoOp,
    VisibilityChanged,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryResult {
    pub name: String,
    pub url: String,
    pub visibility: Visibility,
    pub outcome: SyncOutcome,
    pub commit: Option<CommitInfo>,
    /// Files in the pushed tree, document included; zero when no tree was pushed.
    pub file_count: usize,
    pub diff: Option<TreeDiff>,
}

/// Account summary for the `info` command.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountOverview {
    pub total: usize,
    /// Most recently updated first.
    pub recent: Vec<RepositoryMetadata>,
}

/// Git blob id of `content`: SHA-1 over `blob <len>\0<content>`.
pub fn git_blob_id(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", content.len()).as_bytes());
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Diff `local` against `remote` by path, blob id and file mode.
pub fn diff_trees(local: &FileTree, remote: &RemoteTree) -> TreeDiff {
    let remote_files: HashMap<&str, &RemoteFile> =
        remote.files.iter().map(|f| (f.path.as_str(), f)).collect();

    let mut diff = TreeDiff::default();
    for (path, content) in local.iter() {
        match remote_files.get(path) {
            None => diff.added.push(path.to_string()),
            Some(file) if file.blob_id == git_blob_id(content) && file.mode == local.mode(path) => {
                diff.unchanged += 1
            }
            Some(_) => diff.modified.push(path.to_string()),
        }
    }
    diff.deleted = remote
        .files
        .iter()
        .filter(|f| !local.contains(&f.path))
        .map(|f| f.path.clone())
        .collect();
    diff.deleted.sort();
    diff
}

/// `tree` with the description document written at its path.
pub fn with_document(tree: &FileTree, document: &DescriptionDocument) -> FileTree {
    let mut tree = tree.clone();
    if let Some(replaced) = tree.upsert(&document.path, document.content.as_bytes().to_vec()) {
        if replaced != document.path {
            debug!(replaced = %replaced, path = %document.path, "[SYNC] Document replaces case variant");
        }
    }
    tree
}

pub struct RepositorySynchronizer<H> {
    host: H,
    timeout: Duration,
}

impl<H: RepositoryHost> RepositorySynchronizer<H> {
    pub fn new(host: H, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Await one remote call under the per-call timeout, classifying its failure.
    async fn call<T, F>(&self, operation: &'static str, name: &str, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, HostError>>,
    {
        self.call_within(self.timeout, operation, name, fut).await
    }

    async fn call_within<T, F>(
        &self,
        timeout: Duration,
        operation: &'static str,
        name: &str,
        fut: F,
    ) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, HostError>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, repository = %name, error = ?e, "[SYNC][ERROR] Remote call failed");
                Err(self.classify(operation, name, e))
            }
            Err(_) => {
                error!(operation, repository = %name, timeout_secs = timeout.as_secs(), "[SYNC][ERROR] Remote call timed out");
                Err(SyncError::RemoteTimeout { operation, timeout })
            }
        }
    }

    fn classify(&self, operation: &'static str, name: &str, e: HostError) -> SyncError {
        match e {
            HostError::NotFound(_) => SyncError::NotFound(name.to_string()),
            HostError::AlreadyExists(_) => SyncError::AlreadyExists(name.to_string()),
            HostError::InsufficientScope(detail) => SyncError::InsufficientScope {
                operation,
                name: name.to_string(),
                detail,
            },
            HostError::Timeout => SyncError::RemoteTimeout {
                operation,
                timeout: self.timeout,
            },
            source => SyncError::Remote { operation, source },
        }
    }

    /// A tree push issues one request per uploaded blob plus the tree, commit and ref
    /// requests; each of them gets the per-call budget.
    fn push_timeout(&self, commit: &TreeCommit) -> Duration {
        let uploads = commit
            .entries
            .iter()
            .filter(|e| matches!(e.source, BlobSource::Upload(_)))
            .count();
        let requests = u32::try_from(uploads).unwrap_or(u32::MAX).saturating_add(4);
        self.timeout.saturating_mul(requests)
    }

    async fn push(&self, name: &str, commit: TreeCommit) -> Result<CommitInfo, SyncError> {
        let timeout = self.push_timeout(&commit);
        self.call_within(timeout, "push", name, self.host.push_tree(name, commit))
            .await
    }

    async fn require(&self, operation: &'static str, name: &str) -> Result<RepositoryMetadata, SyncError> {
        match self.call(operation, name, self.host.get_repository(name)).await? {
            Some(meta) => Ok(meta),
            None => {
                warn!(operation, repository = %name, "[SYNC] Repository does not exist");
                Err(SyncError::NotFound(name.to_string()))
            }
        }
    }

    /// Create `name` and push `tree` plus `document` as its root commit.
    pub async fn create(
        &self,
        name: &str,
        tree: &FileTree,
        document: &DescriptionDocument,
        visibility: Visibility,
    ) -> Result<RepositoryResult, SyncError> {
        info!(repository = %name, %visibility, files = tree.len(), "[SYNC] Creating repository");

        if self.call("look up", name, self.host.get_repository(name)).await?.is_some() {
            warn!(repository = %name, "[SYNC] Repository already exists");
            return Err(SyncError::AlreadyExists(name.to_string()));
        }

        let request = NewRepository {
            name: name.to_string(),
            description: REPOSITORY_DESCRIPTION.to_string(),
            visibility,
        };
        let meta = self
            .call("create", name, self.host.create_repository(request))
            .await?;
        info!(repository = %name, url = %meta.url, "[SYNC] Repository created");

        let full = with_document(tree, document);
        let commit = TreeCommit {
            branch: meta.default_branch.clone(),
            message: "Initial commit".to_string(),
            parent: None,
            entries: full
                .iter()
                .map(|(path, content)| TreeEntry {
                    path: path.to_string(),
                    source: BlobSource::Upload(content.to_vec()),
                    mode: full.mode(path),
                })
                .collect(),
        };

        let pushed = match self.push(name, commit).await {
            Ok(pushed) => pushed,
            Err(e) => {
                error!(repository = %name, error = %e, "[SYNC][ERROR] Created repository but push failed");
                return Err(PartialFailure::CreatedButNotPushed {
                    name: name.to_string(),
                    url: meta.url.clone(),
                    cause: e.to_string(),
                }
                .into());
            }
        };
        info!(repository = %name, commit = %pushed.id, files = full.len(), "[SYNC] Initial commit pushed");

        Ok(RepositoryResult {
            name: name.to_string(),
            url: meta.url,
            visibility: meta.visibility,
            outcome: SyncOutcome::Created,
            commit: Some(pushed),
            file_count: full.len(),
            diff: None,
        })
    }

    /// Replace the content of `name` with `tree` plus `document` in a single commit.
    pub async fn update(
        &self,
        name: &str,
        tree: &FileTree,
        document: &DescriptionDocument,
    ) -> Result<RepositoryResult, SyncError> {
        info!(repository = %name, files = tree.len(), "[SYNC] Updating repository");
        let meta = self.require("update", name).await?;
        let remote = self
            .call("list contents of", name, self.host.list_contents(name, &meta.default_branch))
            .await?;

        let full = with_document(tree, document);
        let diff = diff_trees(&full, &remote);
        info!(
            repository = %name,
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            unchanged = diff.unchanged,
            "[SYNC] Computed diff against remote"
        );

        if diff.is_empty() {
            info!(repository = %name, "[SYNC] Remote already matches; nothing to commit");
            return Ok(RepositoryResult {
                name: name.to_string(),
                url: meta.url,
                visibility: meta.visibility,
                outcome: SyncOutcome::NoOp,
                commit: None,
                file_count: full.len(),
                diff: Some(diff),
            });
        }

        let remote_ids: HashMap<&str, &str> = remote
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.blob_id.as_str()))
            .collect();
        let entries = full
            .iter()
            .map(|(path, content)| {
                let source = match remote_ids.get(path) {
                    Some(id) if *id == git_blob_id(content) => BlobSource::Existing(id.to_string()),
                    _ => BlobSource::Upload(content.to_vec()),
                };
                TreeEntry {
                    path: path.to_string(),
                    source,
                    mode: full.mode(path),
                }
            })
            .collect();

        let commit = TreeCommit {
            branch: meta.default_branch.clone(),
            message: format!(
                "Update {name}: {} added, {} modified, {} deleted",
                diff.added.len(),
                diff.modified.len(),
                diff.deleted.len()
            ),
            parent: remote.head.clone(),
            entries,
        };
        let pushed = self.push(name, commit).await?;
        info!(repository = %name, commit = %pushed.id, "[SYNC] Update pushed");

        Ok(RepositoryResult {
            name: name.to_string(),
            url: meta.url,
            visibility: meta.visibility,
            outcome: SyncOutcome::Updated,
            commit: Some(pushed),
            file_count: full.len(),
            diff: Some(diff),
        })
    }

    /// Idempotent: asking for the current visibility reports [`SyncOutcome::NoOp`].
    pub async fn set_visibility(
        &self,
        name: &str,
        visibility: Visibility,
    ) -> Result<RepositoryResult, SyncError> {
        let meta = self.require("change visibility of", name).await?;
        if meta.visibility == visibility {
            info!(repository = %name, %visibility, "[SYNC] Visibility already set");
            return Ok(RepositoryResult {
                name: name.to_string(),
                url: meta.url,
                visibility,
                outcome: SyncOutcome::NoOp,
                commit: None,
                file_count: 0,
                diff: None,
            });
        }

        let updated = self
            .call(
                "change visibility of",
                name,
                self.host.set_visibility(name, visibility),
            )
            .await?;
        info!(repository = %name, %visibility, "[SYNC] Visibility changed");
        Ok(RepositoryResult {
            name: name.to_string(),
            url: updated.url,
            visibility: updated.visibility,
            outcome: SyncOutcome::VisibilityChanged,
            commit: None,
            file_count: 0,
            diff: None,
        })
    }

    /// Irreversibly delete `name`.
    pub async fn delete(&self, name: &str) -> Result<RepositoryResult, SyncError> {
        let meta = self.require("delete", name).await?;
        self.call("delete", name, self.host.delete_repository(name))
            .await?;
        info!(repository = %name, "[SYNC] Repository deleted");
        Ok(RepositoryResult {
            name: name.to_string(),
            url: meta.url,
            visibility: meta.visibility,
            outcome: SyncOutcome::Deleted,
            commit: None,
            file_count: 0,
            diff: None,
        })
    }

    /// Read-only metadata of `name`.
    pub async fn info(&self, name: &str) -> Result<RepositoryMetadata, SyncError> {
        self.require("inspect", name).await
    }

    pub async fn overview(&self) -> Result<AccountOverview, SyncError> {
        let mut repos = self
            .call("list repositories of", "account", self.host.list_repositories())
            .await?;
        let total = repos.len();
        repos.truncate(OVERVIEW_RECENT);
        Ok(AccountOverview {
            total,
            recent: repos,
        })
    }
}
