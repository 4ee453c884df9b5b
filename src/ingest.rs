//! Archive ingestion: validate a received ZIP payload and unpack it into a [`FileTree`].
//!
//! Everything happens in memory; nothing is written to disk. Resource use is bounded by
//! [`IngestLimits`]: the declared payload size, the number of files and the total number
//! of decompressed bytes. Decompressed sizes declared in entry headers are not trusted;
//! reads are capped instead.

use std::io::{Cursor, Read};

use thiserror::Error;
use tracing::{debug, error, info};
use zip::ZipArchive;

use crate::tree::{normalize_path, FileMode, FileTree, TreeError};

pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_FILES: usize = 2000;
/// Upper bound accepted for the configurable byte limits; trees are held in memory.
pub const MAX_CONFIGURABLE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestLimits {
    /// Maximum size of the compressed payload as received.
    pub max_archive_bytes: u64,
    pub max_decompressed_bytes: u64,
    pub max_files: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

/// Why an archive was rejected. No remote side effect has happened when one of these is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("archive too large: {0}")]
    TooLarge(String),

    #[error("archive is corrupt or not a ZIP file: {0}")]
    Corrupt(String),

    #[error("archive contains no files")]
    Empty,

    #[error("entry '{0}' would extract outside the project root")]
    UnsafePath(String),

    #[error(
        "every file is inside the folder '{folder}/'; re-pack the archive with the project files at its root"
    )]
    WrongStructure { folder: String },

    #[error("entry '{incoming}' collides with '{existing}' (paths differ only by case or repeat)")]
    PathCollision { existing: String, incoming: String },
}

impl ArchiveError {
    /// Short machine-readable reason, stable across releases.
    pub fn reason(&self) -> &'static str {
        match self {
            ArchiveError::TooLarge(_) => "too_large",
            ArchiveError::Corrupt(_) => "corrupt",
            ArchiveError::Empty => "empty",
            ArchiveError::UnsafePath(_) => "unsafe_path",
            ArchiveError::WrongStructure { .. } => "wrong_structure",
            ArchiveError::PathCollision { .. } => "path_collision",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveIngestor {
    limits: IngestLimits,
}

impl ArchiveIngestor {
    pub fn new(limits: IngestLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> IngestLimits {
        self.limits
    }

    /// Validate and unpack `payload`.
    ///
    /// The resulting tree holds byte-identical file contents under normalised paths.
    pub fn ingest(&self, payload: &[u8]) -> Result<FileTree, ArchiveError> {
        let limits = self.limits;
        info!(bytes = payload.len(), "[INGEST] Received archive payload");

        if payload.len() as u64 > limits.max_archive_bytes {
            error!(bytes = payload.len(), max = limits.max_archive_bytes, "[INGEST] Payload exceeds size limit");
            return Err(ArchiveError::TooLarge(format!(
                "{} bytes received, limit is {} bytes",
                payload.len(),
                limits.max_archive_bytes
            )));
        }

        let mut archive = ZipArchive::new(Cursor::new(payload)).map_err(|e| {
            error!(error = ?e, "[INGEST] Failed to open archive");
            ArchiveError::Corrupt(e.to_string())
        })?;

        let mut tree = FileTree::new();
        let mut decompressed: u64 = 0;

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| {
                error!(index, error = ?e, "[INGEST] Failed to read entry header");
                ArchiveError::Corrupt(e.to_string())
            })?;
            if entry.is_dir() {
                continue;
            }

            let raw_name = entry.name().to_string();
            let path = match normalize_path(&raw_name) {
                Ok(Some(path)) => path,
                Ok(None) => continue,
                Err(_) => {
                    error!(entry = %raw_name, "[INGEST] Rejecting path traversal entry");
                    return Err(ArchiveError::UnsafePath(raw_name));
                }
            };

            if tree.len() >= limits.max_files {
                error!(max = limits.max_files, "[INGEST] File count limit exceeded");
                return Err(ArchiveError::TooLarge(format!(
                    "more than {} files",
                    limits.max_files
                )));
            }

            let remaining = limits.max_decompressed_bytes - decompressed;
            let mut content = Vec::new();
            entry
                .by_ref()
                .take(remaining.saturating_add(1))
                .read_to_end(&mut content)
                .map_err(|e| {
                    error!(entry = %path, error = ?e, "[INGEST] Failed to decompress entry");
                    ArchiveError::Corrupt(format!("{path}: {e}"))
                })?;
            if content.len() as u64 > remaining {
                error!(max = limits.max_decompressed_bytes, "[INGEST] Decompressed size limit exceeded");
                return Err(ArchiveError::TooLarge(format!(
                    "more than {} bytes once decompressed",
                    limits.max_decompressed_bytes
                )));
            }
            decompressed += content.len() as u64;

            let mode = entry
                .unix_mode()
                .map(FileMode::from_unix_mode)
                .unwrap_or_default();
            debug!(entry = %path, size = content.len(), ?mode, "[INGEST] Unpacked entry");
            tree.insert_with_mode(path, content, mode).map_err(|e| match e {
                TreeError::Collision { existing, incoming } => {
                    ArchiveError::PathCollision { existing, incoming }
                }
                TreeError::UnsafePath(p) => ArchiveError::UnsafePath(p),
            })?;
        }

        if tree.is_empty() {
            error!("[INGEST] Archive holds no files");
            return Err(ArchiveError::Empty);
        }

        if let Some(folder) = single_wrapping_folder(&tree) {
            error!(folder = %folder, "[INGEST] Archive wraps everything in one folder");
            return Err(ArchiveError::WrongStructure { folder });
        }

        info!(files = tree.len(), bytes = decompressed, "[INGEST] Archive unpacked");
        Ok(tree)
    }
}

/// The folder name when every file lives under the same top-level directory.
fn single_wrapping_folder(tree: &FileTree) -> Option<String> {
    let mut folder: Option<&str> = None;
    for path in tree.paths() {
        let (first, _) = path.split_once('/')?;
        match folder {
            None => folder = Some(first),
            Some(seen) if seen == first => {}
            Some(_) => return None,
        }
    }
    folder.map(str::to_string)
}
