//! Project analysis: classify the languages and frameworks of an unpacked tree.
//!
//! Classification is table driven. Extensions map to languages, marker files map to
//! ecosystems, and `package.json` dependencies map to frameworks. Adding a detection
//! means adding a row, not a branch.
//!
//! [`analyze`] is a pure function of the tree: identical trees give identical results,
//! including ordering. It never fails; an unrecognised tree yields an empty detection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::tree::FileTree;

/// Detections below this confidence are dropped from the result.
pub const MIN_CONFIDENCE: f64 = 0.1;
/// Confidence assigned to anything implied by a marker file.
pub const MARKER_CONFIDENCE: f64 = 0.95;
/// Confidence assigned to frameworks found among `package.json` dependencies.
pub const DEPENDENCY_CONFIDENCE: f64 = 0.9;

pub const DOCUMENT_FILE_NAME: &str = "README.md";

const EXTENSION_RULES: &[(&str, &str)] = &[
    ("bat", "Batch"),
    ("c", "C"),
    ("cpp", "C++"),
    ("cs", "C#"),
    ("css", "CSS"),
    ("dart", "Dart"),
    ("go", "Go"),
    ("html", "HTML"),
    ("java", "Java"),
    ("js", "JavaScript"),
    ("jsx", "React JSX"),
    ("kt", "Kotlin"),
    ("m", "Objective-C"),
    ("php", "PHP"),
    ("ps1", "PowerShell"),
    ("py", "Python"),
    ("r", "R"),
    ("rb", "Ruby"),
    ("rs", "Rust"),
    ("sass", "Sass"),
    ("scss", "SCSS"),
    ("sh", "Shell"),
    ("swift", "Swift"),
    ("ts", "TypeScript"),
    ("tsx", "React TSX"),
    ("vue", "Vue.js"),
];

struct MarkerRule {
    file: &'static str,
    languages: &'static [&'static str],
    frameworks: &'static [&'static str],
}

const MARKER_RULES: &[MarkerRule] = &[
    MarkerRule { file: "package.json", languages: &["JavaScript"], frameworks: &["Node.js", "npm"] },
    MarkerRule { file: "requirements.txt", languages: &["Python"], frameworks: &[] },
    MarkerRule { file: "setup.py", languages: &["Python"], frameworks: &[] },
    MarkerRule { file: "Pipfile", languages: &["Python"], frameworks: &["Pipenv"] },
    MarkerRule { file: "manage.py", languages: &["Python"], frameworks: &["Django"] },
    MarkerRule { file: "Cargo.toml", languages: &["Rust"], frameworks: &["Cargo"] },
    MarkerRule { file: "go.mod", languages: &["Go"], frameworks: &[] },
    MarkerRule { file: "pom.xml", languages: &["Java"], frameworks: &["Maven"] },
    MarkerRule { file: "build.gradle", languages: &["Java"], frameworks: &["Gradle"] },
    MarkerRule { file: "composer.json", languages: &["PHP"], frameworks: &["Composer"] },
    MarkerRule { file: "Gemfile", languages: &["Ruby"], frameworks: &["Bundler"] },
    MarkerRule { file: "pubspec.yaml", languages: &["Dart"], frameworks: &["Flutter"] },
    MarkerRule { file: "tsconfig.json", languages: &["TypeScript"], frameworks: &[] },
    MarkerRule { file: "vue.config.js", languages: &[], frameworks: &["Vue.js"] },
    MarkerRule { file: "angular.json", languages: &[], frameworks: &["Angular"] },
    MarkerRule { file: "next.config.js", languages: &[], frameworks: &["Next.js"] },
    MarkerRule { file: "nuxt.config.js", languages: &[], frameworks: &["Nuxt.js"] },
    MarkerRule { file: "gatsby-config.js", languages: &[], frameworks: &["Gatsby"] },
    MarkerRule { file: "webpack.config.js", languages: &[], frameworks: &["Webpack"] },
    MarkerRule { file: "vite.config.js", languages: &[], frameworks: &["Vite"] },
    MarkerRule { file: "vite.config.ts", languages: &[], frameworks: &["Vite"] },
    MarkerRule { file: "tailwind.config.js", languages: &[], frameworks: &["Tailwind CSS"] },
    MarkerRule { file: "postcss.config.js", languages: &[], frameworks: &["PostCSS"] },
];

/// `package.json` dependency names and the framework each one implies.
const DEPENDENCY_RULES: &[(&str, &str)] = &[
    ("@angular/core", "Angular"),
    ("@chakra-ui/react", "Chakra UI"),
    ("@material-ui/core", "Material-UI"),
    ("@mui/material", "Material-UI"),
    ("@nestjs/core", "NestJS"),
    ("antd", "Ant Design"),
    ("bootstrap", "Bootstrap"),
    ("bulma", "Bulma"),
    ("express", "Express.js"),
    ("fastify", "Fastify"),
    ("koa", "Koa.js"),
    ("lit", "Lit"),
    ("next", "Next.js"),
    ("nuxt", "Nuxt.js"),
    ("react", "React"),
    ("solid-js", "Solid.js"),
    ("svelte", "Svelte"),
    ("vue", "Vue.js"),
];

/// Project kind rules, first match wins: (marker file, extension, kind).
const KIND_RULES: &[(Option<&str>, Option<&str>, &str)] = &[
    (Some("package.json"), None, "Web Application"),
    (Some("manage.py"), None, "Django Application"),
    (None, Some("py"), "Python Application"),
    (None, Some("java"), "Java Application"),
    (None, Some("c"), "C/C++ Application"),
    (None, Some("cpp"), "C/C++ Application"),
    (None, Some("go"), "Go Application"),
    (Some("Cargo.toml"), None, "Rust Application"),
    (None, Some("rs"), "Rust Application"),
    (None, Some("php"), "PHP Application"),
    (None, Some("rb"), "Ruby Application"),
];

const DEFAULT_KIND: &str = "Application";

/// A detected language or framework.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub name: String,
    /// In `[0, 1]`.
    pub confidence: f64,
}

/// How the project is built and started, chosen from root marker files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    Npm,
    Pip,
    Cargo,
    Go,
    Generic,
}

/// The description document found at the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingDocument {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedProject {
    /// Sorted by descending confidence, then extension, then name.
    pub languages: Vec<Detection>,
    /// Sorted by descending confidence, then name.
    pub frameworks: Vec<Detection>,
    /// File count per lower-cased extension; files without one are counted under `""`.
    pub file_type_counts: BTreeMap<String, usize>,
    pub project_kind: String,
    pub toolchain: Toolchain,
    pub top_level_dirs: Vec<String>,
    pub root_files: Vec<String>,
    pub existing_document: Option<ExistingDocument>,
}

impl DetectedProject {
    pub fn has_existing_document(&self) -> bool {
        self.existing_document.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.frameworks.is_empty()
    }

    pub fn top_language(&self) -> Option<&str> {
        self.languages.first().map(|d| d.name.as_str())
    }

    pub fn top_framework(&self) -> Option<&str> {
        self.frameworks.first().map(|d| d.name.as_str())
    }

    /// One-line stack summary such as `Python (100%), Django (95%)`.
    pub fn stack_summary(&self) -> String {
        let parts: Vec<String> = self
            .languages
            .iter()
            .chain(self.frameworks.iter())
            .map(|d| format!("{} ({:.0}%)", d.name, d.confidence * 100.0))
            .collect();
        if parts.is_empty() {
            "unknown stack".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn extension(path: &str) -> Option<String> {
    let name = file_name(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}

fn language_for(ext: &str) -> Option<&'static str> {
    EXTENSION_RULES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

fn raise(map: &mut BTreeMap<String, f64>, name: &str, confidence: f64) {
    let entry = map.entry(name.to_string()).or_insert(0.0);
    if confidence > *entry {
        *entry = confidence;
    }
}

fn by_confidence(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

/// Frameworks named by the dependencies of a root `package.json`.
fn dependency_frameworks(tree: &FileTree) -> Vec<&'static str> {
    let Some(raw) = tree.get("package.json") else {
        return Vec::new();
    };
    let manifest: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "[ANALYZE] Ignoring unparsable package.json");
            return Vec::new();
        }
    };

    let mut names = BTreeSet::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = manifest.get(section).and_then(Value::as_object) {
            names.extend(deps.keys().map(String::as_str));
        }
    }

    DEPENDENCY_RULES
        .iter()
        .filter(|(dep, _)| names.contains(dep))
        .map(|(_, framework)| *framework)
        .collect()
}

fn existing_document(tree: &FileTree) -> Option<ExistingDocument> {
    let (path, bytes) = tree.get_ignore_case(DOCUMENT_FILE_NAME)?;
    match std::str::from_utf8(bytes) {
        Ok(content) => Some(ExistingDocument {
            path: path.to_string(),
            content: content.to_string(),
        }),
        Err(_) => {
            warn!(path = %path, "[ANALYZE] Existing description document is not UTF-8; treating as absent");
            None
        }
    }
}

fn project_kind(tree: &FileTree, file_type_counts: &BTreeMap<String, usize>) -> String {
    let has_marker =
        |marker: &str| tree.paths().any(|p| file_name(p) == marker);
    KIND_RULES
        .iter()
        .find(|(marker, ext, _)| {
            marker.is_some_and(|m| has_marker(m))
                || ext.is_some_and(|e| file_type_counts.contains_key(e))
        })
        .map(|(_, _, kind)| *kind)
        .unwrap_or(DEFAULT_KIND)
        .to_string()
}

fn toolchain(tree: &FileTree) -> Toolchain {
    if tree.contains("package.json") {
        Toolchain::Npm
    } else if tree.contains("requirements.txt") {
        Toolchain::Pip
    } else if tree.contains("Cargo.toml") {
        Toolchain::Cargo
    } else if tree.contains("go.mod") {
        Toolchain::Go
    } else {
        Toolchain::Generic
    }
}

/// Classify `tree`.
pub fn analyze(tree: &FileTree) -> DetectedProject {
    let mut file_type_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut language_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    // Smallest extension seen per language, used to break confidence ties.
    let mut language_ext: BTreeMap<&'static str, String> = BTreeMap::new();
    let mut top_level_dirs = BTreeSet::new();
    let mut root_files = Vec::new();

    for path in tree.paths() {
        match path.split_once('/') {
            Some((dir, _)) => {
                top_level_dirs.insert(dir.to_string());
            }
            None => root_files.push(path.to_string()),
        }

        let ext = extension(path);
        *file_type_counts.entry(ext.clone().unwrap_or_default()).or_default() += 1;
        if let Some(ext) = ext {
            if let Some(lang) = language_for(&ext) {
                *language_counts.entry(lang).or_default() += 1;
                let slot = language_ext.entry(lang).or_insert_with(|| ext.clone());
                if ext < *slot {
                    *slot = ext;
                }
            }
        }
    }

    let recognised: usize = language_counts.values().sum();
    let mut languages: BTreeMap<String, f64> = BTreeMap::new();
    for (lang, count) in &language_counts {
        raise(&mut languages, lang, *count as f64 / recognised as f64);
    }

    let mut frameworks: BTreeMap<String, f64> = BTreeMap::new();
    for rule in MARKER_RULES {
        if tree.paths().any(|p| file_name(p) == rule.file) {
            debug!(marker = rule.file, "[ANALYZE] Marker file present");
            for lang in rule.languages {
                raise(&mut languages, lang, MARKER_CONFIDENCE);
            }
            for framework in rule.frameworks {
                raise(&mut frameworks, framework, MARKER_CONFIDENCE);
            }
        }
    }
    for framework in dependency_frameworks(tree) {
        raise(&mut frameworks, framework, DEPENDENCY_CONFIDENCE);
    }

    let mut languages: Vec<Detection> = languages
        .into_iter()
        .filter(|(_, c)| *c >= MIN_CONFIDENCE)
        .map(|(name, confidence)| Detection { name, confidence })
        .collect();
    languages.sort_by(|a, b| {
        by_confidence(a.confidence, b.confidence)
            .then_with(|| {
                let ea = language_ext.get(a.name.as_str());
                let eb = language_ext.get(b.name.as_str());
                match (ea, eb) {
                    (Some(x), Some(y)) => x.cmp(y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            })
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut frameworks: Vec<Detection> = frameworks
        .into_iter()
        .filter(|(_, c)| *c >= MIN_CONFIDENCE)
        .map(|(name, confidence)| Detection { name, confidence })
        .collect();
    frameworks.sort_by(|a, b| {
        by_confidence(a.confidence, b.confidence).then_with(|| a.name.cmp(&b.name))
    });

    let detected = DetectedProject {
        project_kind: project_kind(tree, &file_type_counts),
        toolchain: toolchain(tree),
        existing_document: existing_document(tree),
        languages,
        frameworks,
        file_type_counts,
        top_level_dirs: top_level_dirs.into_iter().collect(),
        root_files,
    };

    info!(
        files = tree.len(),
        stack = %detected.stack_summary(),
        kind = %detected.project_kind,
        existing_document = detected.has_existing_document(),
        "[ANALYZE] Project classified"
    );
    detected
}
