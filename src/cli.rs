use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::contract::RepositoryHost;
use crate::github::GitHubClient;
use crate::load_config::load_config;
use crate::session::{ArchivePayload, Coordinator, OperatorId};

/// CLI for repo-courier: publish zipped projects as GitHub repositories.
#[derive(Parser)]
#[clap(
    name = "repo-courier",
    version,
    about = "Publish zipped projects to GitHub repositories with a generated README"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive the publishing dialogue from stdin: `/command args` or `send <zip path>`
    Console {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Identity to act as; defaults to the configured owner
        #[clap(long)]
        operator: Option<String>,
    },
    /// Verify the configuration and the GitHub token
    Check {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command { name: String, args: Vec<String> },
    Send(PathBuf),
    Quit,
    Blank,
    Unrecognised(String),
}

impl ConsoleInput {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return ConsoleInput::Blank;
        }
        if line == "quit" || line == "exit" {
            return ConsoleInput::Quit;
        }
        if let Some(path) = line.strip_prefix("send ") {
            return ConsoleInput::Send(PathBuf::from(path.trim()));
        }
        if line.starts_with('/') {
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            let args = parts.map(str::to_string).collect();
            return ConsoleInput::Command { name, args };
        }
        ConsoleInput::Unrecognised(line.to_string())
    }
}

fn read_artifact(path: &Path) -> Result<ArchivePayload> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
    Ok(ArchivePayload::new(file_name, bytes))
}

/// Feed console lines from `input` to `coordinator` as `operator`, writing one reply per line.
pub async fn console<H, R, W>(
    coordinator: &Coordinator<H>,
    operator: &OperatorId,
    input: R,
    mut output: W,
) -> Result<()>
where
    H: RepositoryHost,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match ConsoleInput::parse(&line) {
            ConsoleInput::Blank => continue,
            ConsoleInput::Quit => break,
            ConsoleInput::Unrecognised(text) => {
                format!("unrecognised input '{text}'; use /command args or send <path>")
            }
            ConsoleInput::Command { name, args } => {
                match coordinator.submit_command(operator, &name, &args).await {
                    Ok(response) => response.to_string(),
                    Err(e) => format!("error [{}]: {e}", e.kind()),
                }
            }
            ConsoleInput::Send(path) => match read_artifact(&path) {
                Ok(payload) => match coordinator.submit_artifact(operator, payload).await {
                    Ok(response) => response.to_string(),
                    Err(e) => format!("error [{}]: {e}", e.kind()),
                },
                Err(e) => format!("error [usage]: {e:#}"),
            },
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Console { config, operator } => {
            let settings = load_config(config)?;
            let client = GitHubClient::new(
                settings.file.github.api_base.clone(),
                settings.github_token.clone(),
                settings.remote_timeout(),
            )?;
            let operator = operator
                .map(OperatorId::new)
                .unwrap_or_else(|| settings.owner.clone());
            let coordinator =
                Coordinator::new(settings.owner.clone(), client, settings.pipeline_options());
            tracing::info!(operator = %operator, "Console session starting");
            console(
                &coordinator,
                &operator,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
        }
        Commands::Check { config } => {
            let settings = load_config(config)?;
            let client = GitHubClient::new(
                settings.file.github.api_base.clone(),
                settings.github_token.clone(),
                settings.remote_timeout(),
            )?;
            let login = client
                .login()
                .await
                .context("GitHub token check failed")?;
            println!("Configuration OK. Authenticated as {login}.");
            Ok(())
        }
    }
}
