//! Attestation statements: a structured record of what changed between a
//! base branch and a head ref, for CI and compliance consumers.
//!
//! Building and writing are separate steps. A statement is immutable once
//! built; writing a new one produces a new file, and the default write
//! never replaces an existing statement.

mod report;

pub use report::render_markdown;

use crate::errors::ConductorError;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Line stats for one changed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
}

/// Pull request the statement is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMeta {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationStatement {
    pub base_branch: String,
    pub head_ref: String,
    pub head_commit: String,
    pub pr: Option<PrMeta>,
    pub files: Vec<FileStat>,
    pub generated_at: DateTime<Utc>,
}

impl AttestationStatement {
    pub fn total_additions(&self) -> usize {
        self.files.iter().map(|f| f.additions).sum()
    }

    pub fn total_deletions(&self) -> usize {
        self.files.iter().map(|f| f.deletions).sum()
    }
}

/// Version-control collaborator that supplies diffs and commit ids.
pub trait DiffSource {
    /// Per-file stats between `base` and `head`.
    fn diff_stats(&self, base: &str, head: &str) -> Result<Vec<FileStat>>;

    /// Full commit id for a revision.
    fn resolve_commit(&self, rev: &str) -> Result<String>;
}

pub struct AttestationBuilder<'a> {
    source: &'a dyn DiffSource,
}

impl<'a> AttestationBuilder<'a> {
    pub fn new(source: &'a dyn DiffSource) -> Self {
        Self { source }
    }

    pub fn build(
        &self,
        base_branch: &str,
        head_ref: &str,
        pr: Option<PrMeta>,
    ) -> Result<AttestationStatement> {
        let head_commit = self.source.resolve_commit(head_ref)?;
        let mut files = self.source.diff_stats(base_branch, head_ref)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::info!(
            base = base_branch,
            head = head_ref,
            files = files.len(),
            "attestation built"
        );
        Ok(AttestationStatement {
            base_branch: base_branch.to_string(),
            head_ref: head_ref.to_string(),
            head_commit,
            pr,
            files,
            generated_at: Utc::now(),
        })
    }
}

/// Whether a write may replace an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `AlreadyExists` if the target is present.
    CreateNew,
    /// Replace the target; only for paths the user named explicitly.
    Replace,
}

/// File name for `statement`, unique per head commit and generation time.
pub fn file_name(statement: &AttestationStatement) -> String {
    let commit = statement
        .head_commit
        .get(..12)
        .unwrap_or(&statement.head_commit);
    format!(
        "attestation-{}-{}.json",
        commit,
        statement.generated_at.format("%Y%m%dT%H%M%S%3fZ")
    )
}

/// Write `statement` as pretty JSON, creating parent directories.
///
/// The file appears complete or not at all. Any failure is returned as
/// `StoreIo` naming the target path.
pub fn write(
    path: &Path,
    statement: &AttestationStatement,
    mode: WriteMode,
) -> Result<(), ConductorError> {
    let json = serde_json::to_string_pretty(statement)
        .map_err(|e| ConductorError::serialization("attestation statement", e))?;
    write_text(path, &json, mode)
}

/// Write the human-readable report for a statement.
pub fn write_report(
    path: &Path,
    statement: &AttestationStatement,
    mode: WriteMode,
) -> Result<(), ConductorError> {
    write_text(path, &render_markdown(statement), mode)
}

fn write_text(path: &Path, content: &str, mode: WriteMode) -> Result<(), ConductorError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| ConductorError::store_io(parent, e))?;
    }
    if mode == WriteMode::CreateNew && path.exists() {
        return Err(ConductorError::store_io(
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "attestation already exists"),
        ));
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".tmp.{}", std::process::id()));
    let tmp = path.with_file_name(tmp_name);
    let write_tmp = || -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp);
        return Err(ConductorError::store_io(&tmp, e));
    }

    // hard_link refuses an existing target, closing the race with the check above
    let placed = match mode {
        WriteMode::Replace => fs::rename(&tmp, path),
        WriteMode::CreateNew => fs::hard_link(&tmp, path),
    };
    let _ = fs::remove_file(&tmp);
    placed.map_err(|e| ConductorError::store_io(path, e))?;

    tracing::debug!(path = %path.display(), ?mode, "attestation written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FakeDiff;

    impl DiffSource for FakeDiff {
        fn diff_stats(&self, _base: &str, _head: &str) -> Result<Vec<FileStat>> {
            Ok(vec![
                FileStat {
                    path: "src/z.rs".into(),
                    additions: 3,
                    deletions: 1,
                },
                FileStat {
                    path: "src/a.rs".into(),
                    additions: 10,
                    deletions: 0,
                },
            ])
        }

        fn resolve_commit(&self, rev: &str) -> Result<String> {
            if rev == "HEAD" {
                Ok("a".repeat(40))
            } else {
                anyhow::bail!("unknown revision {rev}")
            }
        }
    }

    fn statement() -> AttestationStatement {
        AttestationBuilder::new(&FakeDiff)
            .build(
                "main",
                "HEAD",
                Some(PrMeta {
                    number: 42,
                    url: Some("https://example.com/pr/42".into()),
                }),
            )
            .unwrap()
    }

    #[test]
    fn test_build_sorts_files_and_totals() {
        let s = statement();
        assert_eq!(s.files[0].path, "src/a.rs");
        assert_eq!(s.total_additions(), 13);
        assert_eq!(s.total_deletions(), 1);
        assert_eq!(s.head_commit.len(), 40);
    }

    #[test]
    fn test_build_propagates_unknown_head() {
        let err = AttestationBuilder::new(&FakeDiff)
            .build("main", "feature/x", None)
            .unwrap_err();
        assert!(err.to_string().contains("feature/x"));
    }

    #[test]
    fn test_serialized_shape_is_camel_case() {
        let value = serde_json::to_value(statement()).unwrap();
        for key in ["baseBranch", "headRef", "headCommit", "pr", "files", "generatedAt"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["pr"]["number"], 42);
        assert_eq!(value["files"][1]["additions"], 3);
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/nested/attestation.json");
        write(&path, &statement(), WriteMode::CreateNew).unwrap();
        let loaded: AttestationStatement =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.base_branch, "main");
    }

    #[test]
    fn test_write_fails_loudly_naming_path() {
        let dir = TempDir::new().unwrap();
        // A regular file where a directory is needed
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let path = blocker.join("attestation.json");

        match write(&path, &statement(), WriteMode::CreateNew) {
            Err(ConductorError::StoreIo { path: p, .. }) => assert!(p.starts_with(&blocker)),
            other => panic!("Expected StoreIo, got {other:?}"),
        }
    }

    #[test]
    fn test_consecutive_statements_do_not_clobber_each_other() {
        let dir = TempDir::new().unwrap();
        let first = statement();
        let mut second = statement();
        second.generated_at = first.generated_at + chrono::Duration::milliseconds(1);
        second.files.truncate(1);

        for s in [&first, &second] {
            write(&dir.path().join(file_name(s)), s, WriteMode::CreateNew).unwrap();
        }

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with("attestation-aaaaaaaaaaaa-")));
        let loaded: AttestationStatement =
            serde_json::from_str(&fs::read_to_string(dir.path().join(file_name(&first))).unwrap())
                .unwrap();
        assert_eq!(loaded, first);
    }

    #[test]
    fn test_create_new_refuses_existing_statement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attestation.json");
        let original = statement();
        write(&path, &original, WriteMode::CreateNew).unwrap();

        let mut other = statement();
        other.base_branch = "develop".into();
        match write(&path, &other, WriteMode::CreateNew) {
            Err(ConductorError::StoreIo { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("Expected AlreadyExists, got {other:?}"),
        }
        let kept: AttestationStatement =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(kept.base_branch, "main");
    }

    #[test]
    fn test_replace_overwrites_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attestation.json");
        write(&path, &statement(), WriteMode::CreateNew).unwrap();

        let mut other = statement();
        other.base_branch = "develop".into();
        write(&path, &other, WriteMode::Replace).unwrap();

        let kept: AttestationStatement =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(kept.base_branch, "develop");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
