//! # session: the operator dialogue
//!
//! [`Coordinator`] binds the authorised operator's commands to the pipeline stages. It is an
//! explicit state machine with two states, `Idle` and `AwaitArchive`:
//!
//! - `upload` / `update_repo` move to `AwaitArchive` and answer immediately.
//! - An artifact completes an `AwaitArchive` session and drives
//!   ingest → analyze → describe → synchronise, then returns to `Idle`.
//! - Every other command runs to completion on its own and never leaves a session behind.
//! - Any command replaces a pending session (last command wins). An artifact that arrives
//!   with nothing pending, or after the session expired, is out of order.
//!
//! The operator guard runs before anything else in both entry points.
//!
//! Session state sits behind one `tokio::sync::Mutex` that is held only for transitions.
//! Extraction and remote calls run outside it, so a new command is accepted while a run
//! is in flight. Each command advances a generation counter and drops the pending session
//! under the same lock that an artifact takes the session under. A run checks the counter
//! before analysis and again before its first remote mutation, and stops with
//! [`PipelineError::Cancelled`] if a newer command arrived.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analyze::analyze;
use crate::contract::{RepositoryHost, RepositoryMetadata, Visibility};
use crate::describe::{synthesize, Mode};
use crate::error::PipelineError;
use crate::ingest::{ArchiveIngestor, IngestLimits};
use crate::synchronise::{
    AccountOverview, RepositoryResult, RepositorySynchronizer, SyncOutcome, TreeDiff,
    DEFAULT_REMOTE_TIMEOUT,
};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);
pub const MAX_REPO_NAME_LEN: usize = 100;

pub const HELP: &str = "\
Commands:
  /upload [template] [name]      publish a new repository from the next ZIP you send
  /update_repo <name> [template] replace the content of <name> with the next ZIP you send
  /info                          account overview
  /inspect <name>                repository details
  /set_private <name>            make <name> private
  /set_public <name>             make <name> public
  /delete <name>                 delete <name> (irreversible)
  /cancel                        drop a pending upload or update
  /help                          this message

Short forms: /upd_repo /inp /priv /pblc /del

Archive structure: put the project files at the root of the ZIP.
  good: project.zip -> main.py, requirements.txt, src/...
  bad:  project.zip -> project/ -> main.py, ...
Without a name, /upload names the repository after the ZIP file.
'template' always generates a new README.md; otherwise an existing README.md is kept.";

static REPO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("Valid repository name regex"));

/// Identity of whoever issued a command, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A received artifact. The file name, when the transport has one, can name the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePayload {
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

impl ArchivePayload {
    pub fn new(file_name: Option<String>, bytes: Vec<u8>) -> Self {
        Self { file_name, bytes }
    }

    /// Repository name implied by the file name: its stem without a `.zip` suffix.
    pub fn derived_name(&self) -> Option<String> {
        let file_name = self.file_name.as_deref()?;
        let base = file_name
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(file_name);
        let stem = match base.len().checked_sub(4) {
            Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".zip") => {
                &base[..cut]
            }
            _ => base,
        };
        (!stem.is_empty()).then(|| stem.to_string())
    }
}

/// Check `name` against hosting-service naming rules.
pub fn validate_repo_name(name: &str) -> Result<(), PipelineError> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.len() > MAX_REPO_NAME_LEN {
        Some(format!("longer than {MAX_REPO_NAME_LEN} characters"))
    } else if !REPO_NAME.is_match(name) {
        Some("only letters, digits, '-', '_' and '.' are allowed".to_string())
    } else if name.starts_with('-') || name.ends_with('-') {
        Some("must not start or end with '-'".to_string())
    } else if name.contains("--") {
        Some("must not contain '--'".to_string())
    } else if name == "." || name == ".." {
        Some("'.' and '..' are reserved".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PipelineError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// A parsed top-level command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload { mode: Mode, name: Option<String> },
    Update { mode: Mode, name: String },
    Info,
    Inspect(String),
    Delete(String),
    SetVisibility { name: String, visibility: Visibility },
    Help,
    Cancel,
}

impl Command {
    /// Parse a command name (leading `/` optional, case-insensitive) and its arguments.
    pub fn parse(command: &str, args: &[String]) -> Result<Self, PipelineError> {
        let name = command.trim().trim_start_matches('/').to_lowercase();
        let args: Vec<&str> = args
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect();

        let parsed = match name.as_str() {
            "upload" => {
                let (mode, name) = mode_and_name(&args, "upload [template] [name]")?;
                Command::Upload { mode, name }
            }
            "update_repo" | "upd_repo" => {
                let usage = "update_repo <name> [template]";
                match mode_and_name(&args, usage)? {
                    (mode, Some(name)) => Command::Update { mode, name },
                    (_, None) => return Err(usage_error(usage)),
                }
            }
            "info" => Command::Info,
            "inspect" | "inp" => Command::Inspect(single_name(&args, "inspect <name>")?),
            "delete" | "del" => Command::Delete(single_name(&args, "delete <name>")?),
            "set_private" | "priv" => Command::SetVisibility {
                name: single_name(&args, "set_private <name>")?,
                visibility: Visibility::Private,
            },
            "set_public" | "pblc" => Command::SetVisibility {
                name: single_name(&args, "set_public <name>")?,
                visibility: Visibility::Public,
            },
            "help" | "start" => Command::Help,
            "cancel" => Command::Cancel,
            other => {
                return Err(PipelineError::Usage(format!(
                    "unknown command '/{other}'; send /help for the list"
                )))
            }
        };

        if let Some(name) = parsed.repository() {
            validate_repo_name(name)?;
        }
        Ok(parsed)
    }

    /// The repository this command names, if any.
    pub fn repository(&self) -> Option<&str> {
        match self {
            Command::Upload { name, .. } => name.as_deref(),
            Command::Update { name, .. }
            | Command::Inspect(name)
            | Command::Delete(name)
            | Command::SetVisibility { name, .. } => Some(name),
            Command::Info | Command::Help | Command::Cancel => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Command::Upload { .. } => "upload",
            Command::Update { .. } => "update_repo",
            Command::Info => "info",
            Command::Inspect(_) => "inspect",
            Command::Delete(_) => "delete",
            Command::SetVisibility {
                visibility: Visibility::Private,
                ..
            } => "set_private",
            Command::SetVisibility {
                visibility: Visibility::Public,
                ..
            } => "set_public",
            Command::Help => "help",
            Command::Cancel => "cancel",
        }
    }
}

fn usage_error(usage: &str) -> PipelineError {
    PipelineError::Usage(format!("usage: /{usage}"))
}

fn mode_and_name(args: &[&str], usage: &str) -> Result<(Mode, Option<String>), PipelineError> {
    let mut mode = Mode::Normal;
    let mut name = None;
    for arg in args {
        if arg.eq_ignore_ascii_case("template") && mode == Mode::Normal {
            mode = Mode::Template;
        } else if name.is_none() {
            name = Some(arg.to_string());
        } else {
            return Err(usage_error(usage));
        }
    }
    Ok((mode, name))
}

fn single_name(args: &[&str], usage: &str) -> Result<String, PipelineError> {
    match args {
        [name] => Ok(name.to_string()),
        _ => Err(usage_error(usage)),
    }
}

/// What an `AwaitArchive` session will do with the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    /// Create a repository; without a name it is taken from the archive.
    Create { name: Option<String> },
    Update { name: String },
}

#[derive(Debug, Clone)]
struct PendingSession {
    id: Uuid,
    mode: Mode,
    action: PendingAction,
    created_at: DateTime<Utc>,
    deadline: Instant,
}

#[derive(Debug, Default)]
enum SessionState {
    #[default]
    Idle,
    AwaitArchive(PendingSession),
}

/// Result of a completed upload or update run.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub repository: String,
    pub url: String,
    pub outcome: SyncOutcome,
    pub visibility: Visibility,
    pub mode: Mode,
    pub file_count: usize,
    pub stack: String,
    pub document_synthesized: bool,
    pub commit: Option<String>,
    pub diff: Option<TreeDiff>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    AwaitingArchive {
        mode: Mode,
        action: PendingAction,
        expires_in: Duration,
    },
    Published(PublishReport),
    Repository(RepositoryResult),
    Metadata(RepositoryMetadata),
    Overview {
        overview: AccountOverview,
        published: u64,
    },
    Help(&'static str),
    Cancelled {
        had_pending: bool,
    },
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::AwaitingArchive {
                mode,
                action,
                expires_in,
            } => {
                match action {
                    PendingAction::Create { name: Some(name) } => {
                        write!(f, "Send the ZIP archive for new repository '{name}'")?
                    }
                    PendingAction::Create { name: None } => write!(
                        f,
                        "Send the ZIP archive; the repository is named after the file"
                    )?,
                    PendingAction::Update { name } => {
                        write!(f, "Send the ZIP archive to replace the content of '{name}'")?
                    }
                }
                write!(
                    f,
                    " ({mode} mode, within {} minutes). Files must sit at the archive root.",
                    expires_in.as_secs() / 60
                )
            }
            Response::Published(report) => {
                let verb = match report.outcome {
                    SyncOutcome::Created => "Created",
                    SyncOutcome::NoOp => "Unchanged",
                    _ => "Updated",
                };
                writeln!(f, "{verb} {} ({})", report.repository, report.visibility)?;
                writeln!(f, "URL: {}", report.url)?;
                writeln!(f, "Files: {}", report.file_count)?;
                writeln!(f, "Stack: {}", report.stack)?;
                let doc = if report.document_synthesized {
                    "generated"
                } else {
                    "kept from archive"
                };
                write!(f, "README: {doc}")?;
                if let Some(diff) = &report.diff {
                    write!(
                        f,
                        "\nChanges: {} added, {} modified, {} deleted",
                        diff.added.len(),
                        diff.modified.len(),
                        diff.deleted.len()
                    )?;
                }
                if let Some(commit) = &report.commit {
                    write!(f, "\nCommit: {commit}")?;
                }
                Ok(())
            }
            Response::Repository(result) => match result.outcome {
                SyncOutcome::Deleted => write!(f, "Deleted {}", result.name),
                SyncOutcome::NoOp => {
                    write!(f, "{} is already {}", result.name, result.visibility)
                }
                _ => write!(f, "{} is now {} ({})", result.name, result.visibility, result.url),
            },
            Response::Metadata(meta) => {
                writeln!(f, "{}", meta.name)?;
                writeln!(
                    f,
                    "Description: {}",
                    meta.description.as_deref().unwrap_or("none")
                )?;
                writeln!(
                    f,
                    "Stars: {}  Forks: {}  Watchers: {}",
                    meta.stars, meta.forks, meta.watchers
                )?;
                writeln!(f, "Size: {} KB", meta.size_kb)?;
                writeln!(f, "Visibility: {}", meta.visibility)?;
                writeln!(f, "Language: {}", meta.language.as_deref().unwrap_or("unknown"))?;
                writeln!(f, "Default branch: {}", meta.default_branch)?;
                write!(f, "URL: {}", meta.url)
            }
            Response::Overview {
                overview,
                published,
            } => {
                writeln!(f, "Repositories: {}", overview.total)?;
                write!(f, "Published by this process: {published}")?;
                if !overview.recent.is_empty() {
                    write!(f, "\nRecently updated:")?;
                    for repo in &overview.recent {
                        write!(
                            f,
                            "\n- {} ({} stars): {}",
                            repo.name,
                            repo.stars,
                            repo.description.as_deref().unwrap_or("no description")
                        )?;
                    }
                }
                Ok(())
            }
            Response::Help(text) => f.write_str(text),
            Response::Cancelled { had_pending: true } => f.write_str("Pending session cancelled"),
            Response::Cancelled { had_pending: false } => f.write_str("Nothing to cancel"),
        }
    }
}

/// Tunables of the pipeline, usually built from the loaded settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub limits: IngestLimits,
    pub default_visibility: Visibility,
    pub session_ttl: Duration,
    pub remote_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            limits: IngestLimits::default(),
            default_visibility: Visibility::Public,
            session_ttl: DEFAULT_SESSION_TTL,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

pub struct Coordinator<H> {
    owner: OperatorId,
    ingestor: ArchiveIngestor,
    synchronizer: RepositorySynchronizer<H>,
    default_visibility: Visibility,
    session_ttl: Duration,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    published: AtomicU64,
}

impl<H: RepositoryHost> Coordinator<H> {
    pub fn new(owner: OperatorId, host: H, options: PipelineOptions) -> Self {
        Self {
            owner,
            ingestor: ArchiveIngestor::new(options.limits),
            synchronizer: RepositorySynchronizer::new(host, options.remote_timeout),
            default_visibility: options.default_visibility,
            session_ttl: options.session_ttl,
            state: Mutex::new(SessionState::Idle),
            generation: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> &OperatorId {
        &self.owner
    }

    /// Number of repositories created through this coordinator.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Whether an `AwaitArchive` session is pending and not yet expired.
    pub async fn is_awaiting_archive(&self) -> bool {
        match &*self.state.lock().await {
            SessionState::Idle => false,
            SessionState::AwaitArchive(pending) => Instant::now() < pending.deadline,
        }
    }

    fn authorize(&self, operator: &OperatorId) -> Result<(), PipelineError> {
        if *operator == self.owner {
            Ok(())
        } else {
            warn!(operator = %operator, "[SESSION] Rejecting unauthorised operator");
            Err(PipelineError::Unauthorized {
                operator: operator.to_string(),
            })
        }
    }

    /// Advance the generation and drop any pending session in one transition.
    ///
    /// Returns the new generation and whether a session was pending.
    async fn begin_command(&self) -> (u64, bool) {
        let mut state = self.state.lock().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let had_pending = match std::mem::take(&mut *state) {
            SessionState::Idle => false,
            SessionState::AwaitArchive(pending) => {
                info!(session_id = %pending.id, "[SESSION] Pending session superseded");
                true
            }
        };
        (generation, had_pending)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Handle one top-level command from `operator`.
    pub async fn submit_command(
        &self,
        operator: &OperatorId,
        command: &str,
        args: &[String],
    ) -> Result<Response, PipelineError> {
        self.authorize(operator)?;
        let command = Command::parse(command, args)?;
        let (generation, had_pending) = self.begin_command().await;
        info!(operator = %operator, command = command.label(), generation, "[SESSION] Command received");

        match command {
            Command::Upload { mode, name } => {
                let action = PendingAction::Create { name };
                self.open_session(mode, action, generation).await
            }
            Command::Update { mode, name } => {
                self.synchronizer.info(&name).await?;
                let action = PendingAction::Update { name };
                self.open_session(mode, action, generation).await
            }
            Command::Info => {
                let overview = self.synchronizer.overview().await?;
                Ok(Response::Overview {
                    overview,
                    published: self.published(),
                })
            }
            Command::Inspect(name) => Ok(Response::Metadata(self.synchronizer.info(&name).await?)),
            Command::Delete(name) => Ok(Response::Repository(self.synchronizer.delete(&name).await?)),
            Command::SetVisibility { name, visibility } => Ok(Response::Repository(
                self.synchronizer.set_visibility(&name, visibility).await?,
            )),
            Command::Help => Ok(Response::Help(HELP)),
            Command::Cancel => Ok(Response::Cancelled { had_pending }),
        }
    }

    async fn open_session(
        &self,
        mode: Mode,
        action: PendingAction,
        generation: u64,
    ) -> Result<Response, PipelineError> {
        let pending = PendingSession {
            id: Uuid::new_v4(),
            mode,
            action: action.clone(),
            created_at: Utc::now(),
            deadline: Instant::now() + self.session_ttl,
        };

        let mut state = self.state.lock().await;
        // A newer command arrived while this one was checking the remote.
        if !self.is_current(generation) {
            warn!("[SESSION] Command superseded before its session opened");
            return Err(PipelineError::Cancelled);
        }
        if let SessionState::AwaitArchive(previous) = &*state {
            info!(session_id = %previous.id, "[SESSION] Pending session superseded");
        }
        info!(
            session_id = %pending.id,
            %mode,
            action = ?pending.action,
            created_at = %pending.created_at,
            ttl_secs = self.session_ttl.as_secs(),
            "[SESSION] Awaiting archive"
        );
        *state = SessionState::AwaitArchive(pending);

        Ok(Response::AwaitingArchive {
            mode,
            action,
            expires_in: self.session_ttl,
        })
    }

    /// Handle an artifact from `operator`, completing the pending session.
    pub async fn submit_artifact(
        &self,
        operator: &OperatorId,
        payload: ArchivePayload,
    ) -> Result<Response, PipelineError> {
        self.authorize(operator)?;

        // The generation is read in the same transition that takes the session, so a
        // command either clears the session first or cancels this run.
        let (pending, generation) = {
            let mut state = self.state.lock().await;
            let pending = match std::mem::take(&mut *state) {
                SessionState::Idle => {
                    warn!(operator = %operator, "[SESSION] Unsolicited archive");
                    return Err(PipelineError::OutOfOrder(
                        "no upload is pending; send /upload or /update_repo <name> first".to_string(),
                    ));
                }
                SessionState::AwaitArchive(pending) if Instant::now() >= pending.deadline => {
                    warn!(session_id = %pending.id, "[SESSION] Archive arrived after the session expired");
                    return Err(PipelineError::OutOfOrder(
                        "the pending session expired; send the command again".to_string(),
                    ));
                }
                SessionState::AwaitArchive(pending) => pending,
            };
            (pending, self.generation.load(Ordering::SeqCst))
        };
        info!(
            session_id = %pending.id,
            bytes = payload.bytes.len(),
            file_name = payload.file_name.as_deref().unwrap_or(""),
            "[SESSION] Archive received"
        );

        let result = self.run_pipeline(&pending, payload, generation).await;
        match &result {
            Ok(_) => info!(session_id = %pending.id, "[SESSION] Session completed"),
            Err(e) => {
                error!(session_id = %pending.id, kind = e.kind(), error = %e, "[SESSION] Session failed")
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        pending: &PendingSession,
        payload: ArchivePayload,
        generation: u64,
    ) -> Result<Response, PipelineError> {
        let name = match &pending.action {
            PendingAction::Create { name: Some(name) } | PendingAction::Update { name } => {
                name.clone()
            }
            PendingAction::Create { name: None } => {
                let name = payload.derived_name().ok_or_else(|| {
                    PipelineError::Usage(
                        "the archive has no file name; send /upload <name> first".to_string(),
                    )
                })?;
                validate_repo_name(&name)?;
                name
            }
        };

        let ingestor = self.ingestor.clone();
        let bytes = payload.bytes;
        let tree = tokio::task::spawn_blocking(move || ingestor.ingest(&bytes))
            .await
            .map_err(|e| PipelineError::Internal(format!("extraction task failed: {e}")))??;

        if !self.is_current(generation) {
            warn!(session_id = %pending.id, "[SESSION] Superseded before analysis");
            return Err(PipelineError::Cancelled);
        }

        let detected = analyze(&tree);
        let document = synthesize(&detected, pending.mode, &name);

        if !self.is_current(generation) {
            warn!(session_id = %pending.id, "[SESSION] Superseded before remote changes");
            return Err(PipelineError::Cancelled);
        }

        let result = match &pending.action {
            PendingAction::Create { .. } => {
                let result = self
                    .synchronizer
                    .create(&name, &tree, &document, self.default_visibility)
                    .await?;
                self.published.fetch_add(1, Ordering::SeqCst);
                result
            }
            PendingAction::Update { .. } => {
                self.synchronizer.update(&name, &tree, &document).await?
            }
        };

        Ok(Response::Published(PublishReport {
            repository: result.name,
            url: result.url,
            outcome: result.outcome,
            visibility: result.visibility,
            mode: pending.mode,
            file_count: result.file_count,
            stack: detected.stack_summary(),
            document_synthesized: document.synthesized,
            commit: result.commit.map(|c| c.id),
            diff: result.diff,
        }))
    }
}
