//! Path-keyed, normalised representation of an unpacked project.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Git file mode of a tree entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
}

impl FileMode {
    pub fn git_mode(self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
        }
    }

    /// Anything other than `100755` is treated as a regular file.
    pub fn from_git_mode(mode: &str) -> Self {
        if mode == "100755" {
            FileMode::Executable
        } else {
            FileMode::Regular
        }
    }

    /// Mode implied by Unix permission bits: executable when any execute bit is set.
    pub fn from_unix_mode(mode: u32) -> Self {
        if mode & 0o111 != 0 {
            FileMode::Executable
        } else {
            FileMode::Regular
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("path '{0}' escapes the project root")]
    UnsafePath(String),

    #[error("'{incoming}' collides with '{existing}' on case-insensitive targets")]
    Collision { existing: String, incoming: String },
}

/// Ordered mapping from forward-slash relative path to file bytes.
///
/// Invariants: every key is relative, contains no `.`/`..` segments, and no two keys are
/// equal when compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    files: BTreeMap<String, Vec<u8>>,
    folded: HashMap<String, String>,
    executables: BTreeSet<String>,
}

/// Normalise a raw archive path into tree form.
///
/// Backslashes become `/`, empty and `.` segments are dropped. Absolute paths, drive
/// prefixes, `..` segments and NUL bytes are rejected. Returns `Ok(None)` for paths that
/// normalise to the root itself.
pub fn normalize_path(raw: &str) -> Result<Option<String>, TreeError> {
    let unified = raw.replace('\\', "/");
    let has_drive = unified.len() >= 2 && unified.as_bytes()[1] == b':';
    if unified.starts_with('/') || has_drive || unified.contains('\0') {
        return Err(TreeError::UnsafePath(raw.to_string()));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(TreeError::UnsafePath(raw.to_string())),
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        Ok(None)
    } else {
        Ok(Some(segments.join("/")))
    }
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a regular file under an already normalised path.
    pub fn insert(&mut self, path: String, content: Vec<u8>) -> Result<(), TreeError> {
        self.insert_with_mode(path, content, FileMode::Regular)
    }

    pub fn insert_with_mode(
        &mut self,
        path: String,
        content: Vec<u8>,
        mode: FileMode,
    ) -> Result<(), TreeError> {
        let key = path.to_lowercase();
        if let Some(existing) = self.folded.get(&key) {
            return Err(TreeError::Collision {
                existing: existing.clone(),
                incoming: path,
            });
        }
        self.folded.insert(key, path.clone());
        if mode == FileMode::Executable {
            self.executables.insert(path.clone());
        }
        self.files.insert(path, content);
        Ok(())
    }

    /// Insert `content` as a regular file at `path`, replacing any file whose path matches
    /// case-insensitively.
    ///
    /// Returns the path of the replaced file, if any.
    pub fn upsert(&mut self, path: &str, content: Vec<u8>) -> Option<String> {
        let key = path.to_lowercase();
        let replaced = self.folded.remove(&key);
        if let Some(old) = &replaced {
            self.files.remove(old);
            self.executables.remove(old);
        }
        self.folded.insert(key, path.to_string());
        self.files.insert(path.to_string(), content);
        replaced
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Look a file up ignoring case; returns its stored path and content.
    pub fn get_ignore_case(&self, path: &str) -> Option<(&str, &[u8])> {
        let stored = self.folded.get(&path.to_lowercase())?;
        self.files
            .get_key_value(stored)
            .map(|(p, c)| (p.as_str(), c.as_slice()))
    }

    /// Mode of the file at `path`; [`FileMode::Regular`] for unknown paths.
    pub fn mode(&self, path: &str) -> FileMode {
        if self.executables.contains(path) {
            FileMode::Executable
        } else {
            FileMode::Regular
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|c| c.len() as u64).sum()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_slice()))
    }
}
