//! # contract: the hosting-service boundary
//!
//! This module defines the single trait ([`RepositoryHost`]) through which the pipeline
//! reads and mutates remote repositories, plus the plain data types that cross it.
//!
//! ## Interface & Extensibility
//! - Implement [`RepositoryHost`] to target a hosting service (see [`crate::github`]).
//! - All methods are async and return [`HostError`] so callers can tell
//!   "absent" from "forbidden" from "slow".
//! - The contract covers exactly the operations the pipeline relies on:
//!   create, get, list-contents, push-tree, set-visibility, delete (plus a
//!   read-only listing for the account overview).
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall`; `MockRepositoryHost` is exported under the
//!   default `test-export-mocks` feature so integration tests can script remote state.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use crate::tree::FileMode;

/// Who may see a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn is_private(self) -> bool {
        matches!(self, Visibility::Private)
    }

    pub fn from_private(private: bool) -> Self {
        if private {
            Visibility::Private
        } else {
            Visibility::Public
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => f.write_str("public"),
            Visibility::Private => f.write_str("private"),
        }
    }
}

/// Metadata of a remote repository as reported by the hosting service.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryMetadata {
    pub name: String,
    pub url: String,
    pub visibility: Visibility,
    pub default_branch: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub forks: u64,
    pub watchers: u64,
    /// Size in kilobytes, as reported by the service.
    pub size_kb: u64,
    pub updated_at: Option<String>,
}

/// Request to create a new, empty repository.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRepository {
    pub name: String,
    pub description: String,
    pub visibility: Visibility,
}

/// A file as it exists on the remote default branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    /// Git blob id of the file content.
    pub blob_id: String,
    pub mode: FileMode,
}

/// The file listing of a repository's branch head.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteTree {
    /// Commit id the listing was taken from; `None` for a repository without commits.
    pub head: Option<String>,
    pub files: Vec<RemoteFile>,
}

/// Where the content of one entry of a pushed tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// Content already stored remotely under this blob id.
    Existing(String),
    /// New content to upload.
    Upload(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub source: BlobSource,
    pub mode: FileMode,
}

/// A complete tree to be recorded as exactly one commit on `branch`.
///
/// The pushed tree replaces the branch content: paths not listed are absent afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeCommit {
    pub branch: String,
    pub message: String,
    /// Parent commit; `None` records a root commit.
    pub parent: Option<String>,
    pub entries: Vec<TreeEntry>,
}

/// Identity of a pushed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub url: Option<String>,
}

/// Failures reported by a hosting-service implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("credential lacks the required scope: {0}")]
    InsufficientScope(String),

    #[error("credential rejected: {0}")]
    BadCredentials(String),

    #[error("request timed out")]
    Timeout,

    #[error("hosting API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Remote repository operations the pipeline relies on.
///
/// Implementations talk to one account on one hosting service. Every call is a single
/// remote round-trip from the caller's point of view; the synchroniser applies its own
/// timeout around each call and never retries mutations.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Fetch repository metadata; `Ok(None)` when the repository does not exist.
    async fn get_repository(&self, name: &str) -> Result<Option<RepositoryMetadata>, HostError>;

    /// Create an empty repository.
    async fn create_repository(&self, req: NewRepository) -> Result<RepositoryMetadata, HostError>;

    /// List every file on `branch` with its blob id.
    async fn list_contents(&self, name: &str, branch: &str) -> Result<RemoteTree, HostError>;

    /// Record `commit` as a single commit and move the branch onto it.
    async fn push_tree(&self, name: &str, commit: TreeCommit) -> Result<CommitInfo, HostError>;

    async fn set_visibility(
        &self,
        name: &str,
        visibility: Visibility,
    ) -> Result<RepositoryMetadata, HostError>;

    /// Irreversibly delete a repository. Needs the elevated delete scope.
    async fn delete_repository(&self, name: &str) -> Result<(), HostError>;

    /// All repositories of the account, most recently updated first.
    async fn list_repositories(&self) -> Result<Vec<RepositoryMetadata>, HostError>;
}
