//! Workstream manifests and loading from the workstreams directory.
//!
//! This module provides:
//! - `WorkUnit`, the declared metadata of one schedulable workstream
//! - `parse_manifest` for a single markdown (YAML front matter) or YAML file
//! - `load_feature` / `discover_features` for walking a workstreams directory
//!
//! Dependencies are normalised here, at load time: the `parent` field, the
//! explicit `dependencies` list and any unit ids named in a `## Dependencies`
//! section of the markdown body collapse into one `depends_on` list. Nothing
//! downstream distinguishes where a dependency came from.

use crate::errors::ConductorError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

/// Lifecycle status of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Pending,
    Running,
    Blocked,
    Done,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Blocked)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Pending => write!(f, "pending"),
            UnitStatus::Running => write!(f, "running"),
            UnitStatus::Blocked => write!(f, "blocked"),
            UnitStatus::Done => write!(f, "done"),
            UnitStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Rough size estimate declared by the manifest author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Xs,
    S,
    #[default]
    M,
    L,
    Xl,
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SizeClass::Xs => "xs",
            SizeClass::S => "s",
            SizeClass::M => "m",
            SizeClass::L => "l",
            SizeClass::Xl => "xl",
        };
        write!(f, "{}", s)
    }
}

/// File-path globs a unit is permitted to modify, relative to the repo root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredScope {
    /// Implementation file globs
    #[serde(default)]
    pub implementation: Vec<String>,
    /// Test file globs
    #[serde(default)]
    pub tests: Vec<String>,
}

impl DeclaredScope {
    pub fn new(implementation: Vec<String>, tests: Vec<String>) -> Self {
        Self {
            implementation,
            tests,
        }
    }

    /// All declared patterns, implementation first.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.implementation
            .iter()
            .chain(self.tests.iter())
            .map(String::as_str)
    }

    /// An empty scope is legal and means "no files expected".
    pub fn is_empty(&self) -> bool {
        self.implementation.is_empty() && self.tests.is_empty()
    }
}

/// Raw front matter as written by the manifest author.
#[derive(Debug, Deserialize)]
struct ManifestHeader {
    id: String,
    feature: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: UnitStatus,
    #[serde(default)]
    size: SizeClass,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    scope: DeclaredScope,
}

/// One schedulable workstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Unit id, unique within its feature
    pub id: String,
    /// Feature (run) this unit belongs to
    pub feature: String,
    /// Human-readable title
    #[serde(default)]
    pub title: String,
    /// Declared status at load time
    #[serde(default)]
    pub status: UnitStatus,
    /// Size estimate
    #[serde(default)]
    pub size: SizeClass,
    /// Declared file scope
    #[serde(default)]
    pub scope: DeclaredScope,
    /// Direct parent, kept for display only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Normalised dependency ids
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Manifest file the unit was read from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Candidate ids mentioned in the body's dependency section
    #[serde(skip)]
    narrative_refs: Vec<String>,
}

impl WorkUnit {
    /// Create a unit with explicit dependencies and an empty scope.
    pub fn new(id: &str, feature: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            feature: feature.to_string(),
            title: String::new(),
            status: UnitStatus::Pending,
            size: SizeClass::default(),
            scope: DeclaredScope::default(),
            parent: None,
            depends_on,
            source: None,
            narrative_refs: Vec::new(),
        }
    }

    /// Set the declared scope.
    pub fn with_scope(mut self, scope: DeclaredScope) -> Self {
        self.scope = scope;
        self
    }

    /// The single normalised dependency list.
    pub fn dependency_ids(&self) -> &[String] {
        &self.depends_on
    }

    /// Display label: title when present, otherwise the id.
    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// All manifests found for one feature.
#[derive(Debug, Default)]
pub struct FeatureManifests {
    pub feature: String,
    pub units: Vec<WorkUnit>,
    /// Files that failed to parse; fatal for that unit only
    pub errors: Vec<ConductorError>,
}

impl FeatureManifests {
    pub fn get(&self, id: &str) -> Option<&WorkUnit> {
        self.units.iter().find(|u| u.id == id)
    }
}

static DEPENDENCY_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#{1,6}\s+dependencies\s*$").expect("valid regex"));
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+\.)\s+(.*)$").expect("valid regex"));
static ID_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9_.\-]*").expect("valid regex"));

/// Parse one manifest file.
///
/// `.yaml`/`.yml` files are parsed whole; anything else must start with a
/// `---` delimited YAML front matter block.
pub fn parse_manifest(path: &Path, content: &str) -> Result<WorkUnit, ConductorError> {
    let is_yaml = path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml");

    let (front, body) = if is_yaml {
        (content, "")
    } else {
        split_front_matter(content).ok_or_else(|| ConductorError::ManifestParse {
            path: path.to_path_buf(),
            message: "missing '---' front matter block".to_string(),
        })?
    };

    let header: ManifestHeader =
        serde_yaml::from_str(front).map_err(|e| ConductorError::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    if header.id.trim().is_empty() {
        return Err(ConductorError::ManifestParse {
            path: path.to_path_buf(),
            message: "field 'id' must not be empty".to_string(),
        });
    }
    if header.feature.trim().is_empty() {
        return Err(ConductorError::ManifestParse {
            path: path.to_path_buf(),
            message: format!("unit '{}' has an empty 'feature'", header.id),
        });
    }

    let id = header.id.trim().to_string();
    let mut depends_on = Vec::new();
    let mut seen = HashSet::new();
    for dep in header.parent.iter().chain(header.dependencies.iter()) {
        let dep = dep.trim();
        if dep.is_empty() || dep == id {
            continue;
        }
        if seen.insert(dep.to_string()) {
            depends_on.push(dep.to_string());
        }
    }

    Ok(WorkUnit {
        id,
        feature: header.feature.trim().to_string(),
        title: header.title,
        status: header.status,
        size: header.size,
        scope: header.scope,
        parent: header.parent.map(|p| p.trim().to_string()),
        depends_on,
        source: Some(path.to_path_buf()),
        narrative_refs: dependency_section_refs(body),
    })
}

/// Split `---\n<yaml>\n---\n<body>` into its two halves.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let content = content.trim_start_matches('\u{feff}');
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((front, body));
        }
        offset += line.len();
    }
    None
}

/// Tokens from bullet items under a `Dependencies` heading.
fn dependency_section_refs(body: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut in_section = false;

    for line in body.lines() {
        if line.trim_start().starts_with('#') {
            in_section = DEPENDENCY_HEADING.is_match(line.trim());
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some(caps) = BULLET.captures(line) {
            let item = caps.get(1).map_or("", |m| m.as_str());
            refs.extend(ID_TOKEN.find_iter(item).map(|m| m.as_str().to_string()));
        }
    }

    refs
}

/// Fold narrative references that name a known unit into `depends_on`.
///
/// Free-text tokens only count when they match a unit of the same feature,
/// so prose in the section never produces an unresolvable dependency.
pub fn normalize_dependencies(units: &mut [WorkUnit]) {
    let known: HashSet<String> = units.iter().map(|u| u.id.clone()).collect();
    for unit in units.iter_mut() {
        let refs = std::mem::take(&mut unit.narrative_refs);
        for candidate in refs {
            if candidate != unit.id
                && known.contains(&candidate)
                && !unit.depends_on.contains(&candidate)
            {
                unit.depends_on.push(candidate);
            }
        }
    }
}

fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e == "md" || e == "yaml" || e == "yml")
}

/// Load every manifest under `dir` belonging to `feature`.
///
/// A markdown file without front matter is not a manifest and is ignored.
/// A file that looks like a manifest but fails to parse is reported in
/// `errors` without aborting the load.
pub fn load_feature(dir: &Path, feature: &str) -> Result<FeatureManifests, ConductorError> {
    let mut manifests = FeatureManifests {
        feature: feature.to_string(),
        ..Default::default()
    };

    for (path, content) in read_manifest_files(dir)? {
        let is_markdown = path.extension().is_some_and(|e| e == "md");
        if is_markdown && split_front_matter(&content).is_none() {
            tracing::debug!(path = %path.display(), "skipping markdown without front matter");
            continue;
        }

        match parse_manifest(&path, &content) {
            Ok(unit) if unit.feature == feature => manifests.units.push(unit),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "manifest rejected");
                manifests.errors.push(e);
            }
        }
    }

    normalize_dependencies(&mut manifests.units);
    tracing::debug!(
        feature,
        units = manifests.units.len(),
        errors = manifests.errors.len(),
        "loaded feature manifests"
    );
    Ok(manifests)
}

/// List the distinct feature ids declared under `dir`.
pub fn discover_features(dir: &Path) -> Result<Vec<String>, ConductorError> {
    let mut features = BTreeSet::new();
    for (path, content) in read_manifest_files(dir)? {
        if path.extension().is_some_and(|e| e == "md") && split_front_matter(&content).is_none() {
            continue;
        }
        if let Ok(unit) = parse_manifest(&path, &content) {
            features.insert(unit.feature);
        }
    }
    Ok(features.into_iter().collect())
}

fn read_manifest_files(dir: &Path) -> Result<Vec<(PathBuf, String)>, ConductorError> {
    if !dir.is_dir() {
        return Err(ConductorError::store_io(
            dir,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "workstreams directory does not exist",
            ),
        ));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            ConductorError::store_io(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() || !is_manifest_file(entry.path()) {
            continue;
        }
        let content = std::fs::read_to_string(entry.path())
            .map_err(|e| ConductorError::store_io(entry.path(), e))?;
        files.push((entry.path().to_path_buf(), content));
    }
    Ok(files)
}
