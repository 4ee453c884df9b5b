//! Description document synthesis.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analyze::{DetectedProject, Toolchain, DOCUMENT_FILE_NAME};

/// Whether an existing description document is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Keep an existing document when the archive carries one.
    #[default]
    Normal,
    /// Always generate a fresh document.
    Template,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Normal => f.write_str("normal"),
            Mode::Template => f.write_str("template"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionDocument {
    /// Root-relative path the document is written to.
    pub path: String,
    pub content: String,
    /// `false` when the content was passed through from the archive.
    pub synthesized: bool,
}

/// Produce the description document for `repo_name`.
pub fn synthesize(detected: &DetectedProject, mode: Mode, repo_name: &str) -> DescriptionDocument {
    if mode == Mode::Normal {
        if let Some(existing) = &detected.existing_document {
            info!(path = %existing.path, "[DESCRIBE] Keeping existing description document");
            return DescriptionDocument {
                path: existing.path.clone(),
                content: existing.content.clone(),
                synthesized: false,
            };
        }
    }

    // A regenerated document replaces any case variant of the conventional name.
    let path = detected
        .existing_document
        .as_ref()
        .map(|d| d.path.clone())
        .unwrap_or_else(|| DOCUMENT_FILE_NAME.to_string());
    let content = render(detected, repo_name);
    info!(%mode, path = %path, bytes = content.len(), "[DESCRIBE] Generated description document");
    DescriptionDocument {
        path,
        content,
        synthesized: true,
    }
}

fn render(detected: &DetectedProject, repo_name: &str) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_title(&mut out, detected, repo_name);
    let _ = write_stack(&mut out, detected);
    let _ = write_structure(&mut out, detected, repo_name);
    let _ = write_getting_started(&mut out, detected, repo_name);
    let _ = write_footer(&mut out);
    out
}

fn article(word: &str) -> &'static str {
    match word.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('a' | 'e' | 'i' | 'o' | 'u') => "An",
        _ => "A",
    }
}

fn write_title(out: &mut String, detected: &DetectedProject, repo_name: &str) -> std::fmt::Result {
    writeln!(out, "# {repo_name}\n")?;
    let kind = &detected.project_kind;
    let a = article(kind);
    match (detected.top_language(), detected.top_framework()) {
        (Some(lang), Some(framework)) => {
            writeln!(out, "{a} {kind} built with {lang} using {framework}.\n")
        }
        (Some(lang), None) => writeln!(out, "{a} {kind} built with {lang}.\n"),
        (None, Some(framework)) => writeln!(out, "{a} {kind} built using {framework}.\n"),
        (None, None) => writeln!(out, "{a} {kind}.\n"),
    }
}

fn write_stack(out: &mut String, detected: &DetectedProject) -> std::fmt::Result {
    if detected.is_empty() {
        return Ok(());
    }
    writeln!(out, "## Technologies Used\n")?;
    if !detected.languages.is_empty() {
        writeln!(out, "**Languages:**")?;
        for d in &detected.languages {
            writeln!(out, "- {} ({:.0}%)", d.name, d.confidence * 100.0)?;
        }
        writeln!(out)?;
    }
    if !detected.frameworks.is_empty() {
        writeln!(out, "**Frameworks/Libraries:**")?;
        for d in &detected.frameworks {
            writeln!(out, "- {} ({:.0}%)", d.name, d.confidence * 100.0)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_structure(out: &mut String, detected: &DetectedProject, repo_name: &str) -> std::fmt::Result {
    if detected.top_level_dirs.is_empty() && detected.root_files.is_empty() {
        return Ok(());
    }
    writeln!(out, "## Project Structure\n")?;
    writeln!(out, "```")?;
    writeln!(out, "{repo_name}/")?;
    let entries: Vec<String> = detected
        .top_level_dirs
        .iter()
        .map(|d| format!("{d}/"))
        .chain(detected.root_files.iter().cloned())
        .collect();
    for (i, entry) in entries.iter().enumerate() {
        let branch = if i + 1 == entries.len() { "└──" } else { "├──" };
        writeln!(out, "{branch} {entry}")?;
    }
    writeln!(out, "```\n")
}

fn python_entry_point(detected: &DetectedProject) -> &str {
    ["main.py", "app.py", "manage.py"]
        .into_iter()
        .find(|f| detected.root_files.iter().any(|r| r == f))
        .unwrap_or("main.py")
}

fn write_getting_started(
    out: &mut String,
    detected: &DetectedProject,
    repo_name: &str,
) -> std::fmt::Result {
    writeln!(out, "## Getting Started\n")?;

    let (prerequisites, install, usage): (Vec<&str>, Vec<&str>, Vec<String>) =
        match detected.toolchain {
            Toolchain::Npm => (
                vec!["Node.js (v14 or higher)", "npm or yarn"],
                vec!["npm install"],
                vec!["npm start".to_string()],
            ),
            Toolchain::Pip => (
                vec!["Python 3.7+", "pip"],
                vec!["pip install -r requirements.txt"],
                vec![format!("python {}", python_entry_point(detected))],
            ),
            Toolchain::Cargo => (
                vec!["Rust toolchain (stable)"],
                vec!["cargo build --release"],
                vec!["cargo run --release".to_string()],
            ),
            Toolchain::Go => (
                vec!["Go 1.20+"],
                vec!["go mod download"],
                vec!["go run .".to_string()],
            ),
            Toolchain::Generic => (Vec::new(), Vec::new(), Vec::new()),
        };

    if !prerequisites.is_empty() {
        writeln!(out, "### Prerequisites\n")?;
        for p in &prerequisites {
            writeln!(out, "- {p}")?;
        }
        writeln!(out)?;
    }

    writeln!(out, "### Installation\n")?;
    writeln!(out, "```bash")?;
    writeln!(out, "git clone https://github.com/your-username/{repo_name}.git")?;
    writeln!(out, "cd {repo_name}")?;
    for step in &install {
        writeln!(out, "{step}")?;
    }
    writeln!(out, "```\n")?;

    writeln!(out, "### Usage\n")?;
    if usage.is_empty() {
        writeln!(out, "Follow the instructions for your project type.\n")
    } else {
        writeln!(out, "```bash")?;
        for step in &usage {
            writeln!(out, "{step}")?;
        }
        writeln!(out, "```\n")
    }
}

fn write_footer(out: &mut String) -> std::fmt::Result {
    writeln!(out, "## Contributing\n")?;
    writeln!(out, "1. Fork the repository")?;
    writeln!(out, "2. Create your feature branch (`git checkout -b feature/amazing-feature`)")?;
    writeln!(out, "3. Commit your changes (`git commit -m 'Add some amazing feature'`)")?;
    writeln!(out, "4. Push to the branch (`git push origin feature/amazing-feature`)")?;
    writeln!(out, "5. Open a Pull Request\n")?;
    writeln!(out, "## License\n")?;
    writeln!(out, "This project is licensed under the MIT License - see the LICENSE file for details.\n")?;
    writeln!(out, "---\n")?;
    writeln!(out, "*Published with repo-courier*")
}
