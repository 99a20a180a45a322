use crate::attest::{DiffSource, FileStat};
use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, ObjectType, Oid, Repository, Status, StatusOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Paths under this prefix belong to conductor itself and are never
/// reported as touched by a worker.
pub const STATE_DIR_PREFIX: &str = ".conductor/";

/// Working-tree state at one point in time.
///
/// Records HEAD plus every dirty or untracked path with the blob id of its
/// current content (`None` when deleted), so a file that was already dirty
/// before a worker ran only counts as touched if its content changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeSnapshot {
    head: Option<Oid>,
    dirty: BTreeMap<String, Option<Oid>>,
}

impl WorktreeSnapshot {
    pub fn dirty_paths(&self) -> impl Iterator<Item = &str> {
        self.dirty.keys().map(String::as_str)
    }
}

pub struct GitTracker {
    repo: Repository,
    root: PathBuf,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).with_context(|| {
            format!("Failed to open git repository at {}", project_dir.display())
        })?;
        let root = repo
            .workdir()
            .context("Git repository has no working directory")?
            .to_path_buf();
        Ok(Self { repo, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Current HEAD SHA (None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    /// Resolve any revision (`main`, `HEAD~2`, a SHA) to a full commit SHA.
    pub fn resolve_commit(&self, rev: &str) -> Result<String> {
        let commit = self
            .repo
            .revparse_single(rev)
            .and_then(|obj| obj.peel_to_commit())
            .with_context(|| format!("Failed to resolve '{}' to a commit", rev))?;
        Ok(commit.id().to_string())
    }

    /// Paths staged in the index relative to HEAD.
    pub fn staged_paths(&self) -> Result<Vec<String>> {
        let head_tree = match self.head_commit() {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };
        let diff = self
            .repo
            .diff_tree_to_index(head_tree.as_ref(), None, None)
            .context("Failed to diff index against HEAD")?;
        Ok(delta_paths(&diff))
    }

    /// Paths that differ between `base` and the working tree (index and
    /// untracked files included).
    pub fn changed_since(&self, base: &str) -> Result<Vec<String>> {
        let tree = self
            .repo
            .revparse_single(base)
            .and_then(|obj| obj.peel_to_tree())
            .with_context(|| format!("Failed to resolve '{}' to a tree", base))?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))
            .with_context(|| format!("Failed to diff working tree against '{}'", base))?;
        Ok(delta_paths(&diff))
    }

    /// Capture HEAD and every dirty path with its content id.
    pub fn snapshot(&self) -> Result<WorktreeSnapshot> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;

        let mut dirty = BTreeMap::new();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else {
                continue;
            };
            if path.starts_with(STATE_DIR_PREFIX) {
                continue;
            }
            let deleted = entry
                .status()
                .intersects(Status::WT_DELETED | Status::INDEX_DELETED);
            let full = self.root.join(path);
            let content = if deleted || !full.is_file() {
                None
            } else {
                Some(
                    Oid::hash_file(ObjectType::Blob, &full)
                        .with_context(|| format!("Failed to hash {}", full.display()))?,
                )
            };
            dirty.insert(path.to_string(), content);
        }

        Ok(WorktreeSnapshot {
            head: self.head_commit().map(|c| c.id()),
            dirty,
        })
    }

    /// Paths whose state changed since `before`, including paths changed
    /// by commits made in between.
    pub fn touched_since(&self, before: &WorktreeSnapshot) -> Result<Vec<String>> {
        let after = self.snapshot()?;
        let mut touched = BTreeSet::new();

        for (path, content) in &after.dirty {
            if before.dirty.get(path) != Some(content) {
                touched.insert(path.clone());
            }
        }
        // Dirty before and clean now: reverted or committed
        for path in before.dirty.keys() {
            if !after.dirty.contains_key(path) {
                touched.insert(path.clone());
            }
        }

        if after.head != before.head
            && let Some(new_head) = after.head
        {
            let new_tree = self.repo.find_commit(new_head)?.tree()?;
            let old_tree = match before.head {
                Some(oid) => Some(self.repo.find_commit(oid)?.tree()?),
                None => None,
            };
            let diff = self
                .repo
                .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)
                .context("Failed to diff commits made during the unit")?;
            touched.extend(delta_paths(&diff));
        }

        Ok(touched.into_iter().collect())
    }

    /// Per-file line stats between the merge base of `base`/`head` and `head`.
    pub fn diff_stats(&self, base: &str, head: &str) -> Result<Vec<FileStat>> {
        let base_oid = Oid::from_str(&self.resolve_commit(base)?)?;
        let head_oid = Oid::from_str(&self.resolve_commit(head)?)?;
        let merge_base = self
            .repo
            .merge_base(base_oid, head_oid)
            .with_context(|| format!("No merge base between '{}' and '{}'", base, head))?;

        let base_tree = self.repo.find_commit(merge_base)?.tree()?;
        let head_tree = self.repo.find_commit(head_oid)?.tree()?;
        let diff = self
            .repo
            .diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)
            .context("Failed to diff trees")?;

        let mut stats = Vec::new();
        for idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(idx) else {
                continue;
            };
            let Some(path) = delta_path(&delta) else {
                continue;
            };

            let (additions, deletions) = match git2::Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, added, removed) = patch.line_stats()?;
                    (added, removed)
                }
                // Binary files carry no line stats
                None => (0, 0),
            };
            stats.push(FileStat {
                path,
                additions,
                deletions,
            });
        }
        stats.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(stats)
    }
}

impl DiffSource for GitTracker {
    fn diff_stats(&self, base: &str, head: &str) -> Result<Vec<FileStat>> {
        GitTracker::diff_stats(self, base, head)
    }

    fn resolve_commit(&self, rev: &str) -> Result<String> {
        GitTracker::resolve_commit(self, rev)
    }
}

fn delta_path(delta: &git2::DiffDelta<'_>) -> Option<String> {
    let file = match delta.status() {
        Delta::Deleted => delta.old_file(),
        _ => delta.new_file(),
    };
    file.path().map(|p| p.to_string_lossy().replace('\\', "/"))
}

/// Changed paths in `diff`, excluding conductor's own state directory.
fn delta_paths(diff: &git2::Diff<'_>) -> Vec<String> {
    let mut paths: Vec<String> = diff
        .deltas()
        .filter_map(|d| delta_path(&d))
        .filter(|p| !p.starts_with(STATE_DIR_PREFIX))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let tracker = GitTracker::new(dir.path()).unwrap();
        (tracker, dir)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        let file_path = dir.join(name);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&file_path, content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn test_head_sha_unborn_then_populated() {
        let (tracker, dir) = setup_repo();
        assert!(tracker.head_sha().is_none());
        commit_file(dir.path(), "a.txt", "hello", "init");
        let sha = tracker.head_sha().unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(tracker.resolve_commit("HEAD").unwrap(), sha);
    }

    #[test]
    fn test_resolve_unknown_ref_fails_with_name() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "hello", "init");
        let err = tracker.resolve_commit("no-such-branch").unwrap_err();
        assert!(err.to_string().contains("no-such-branch"));
    }

    #[test]
    fn test_touched_since_reports_new_and_modified_files() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "src/lib.rs", "one\n", "init");
        let before = tracker.snapshot().unwrap();

        fs::write(dir.path().join("src/lib.rs"), "one\ntwo\n").unwrap();
        fs::create_dir_all(dir.path().join("src/cart")).unwrap();
        fs::write(dir.path().join("src/cart/mod.rs"), "pub fn x() {}\n").unwrap();

        let touched = tracker.touched_since(&before).unwrap();
        assert_eq!(touched, vec!["src/cart/mod.rs", "src/lib.rs"]);
    }

    #[test]
    fn test_preexisting_dirty_file_only_counts_when_changed() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "notes.txt", "a\n", "init");
        fs::write(dir.path().join("notes.txt"), "a\nb\n").unwrap();
        let before = tracker.snapshot().unwrap();
        assert_eq!(before.dirty_paths().collect::<Vec<_>>(), vec!["notes.txt"]);

        fs::write(dir.path().join("other.txt"), "x").unwrap();
        assert_eq!(tracker.touched_since(&before).unwrap(), vec!["other.txt"]);

        fs::write(dir.path().join("notes.txt"), "a\nb\nc\n").unwrap();
        let touched = tracker.touched_since(&before).unwrap();
        assert!(touched.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn test_state_dir_is_excluded() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "a", "init");
        let before = tracker.snapshot().unwrap();
        fs::create_dir_all(dir.path().join(".conductor/checkpoints")).unwrap();
        fs::write(dir.path().join(".conductor/checkpoints/f.json"), "{}").unwrap();
        assert!(tracker.touched_since(&before).unwrap().is_empty());

        fs::write(dir.path().join("b.txt"), "b").unwrap();
        assert_eq!(tracker.changed_since("HEAD").unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn test_commits_made_during_unit_are_touched() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "a", "init");
        let before = tracker.snapshot().unwrap();
        commit_file(dir.path(), "b.txt", "b", "worker commit");
        assert_eq!(tracker.touched_since(&before).unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn test_staged_paths() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "a", "init");
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("c.txt"), "c").unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("b.txt")).unwrap();
        index.write().unwrap();

        assert_eq!(tracker.staged_paths().unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn test_changed_since_includes_untracked() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "a", "init");
        fs::write(dir.path().join("a.txt"), "changed").unwrap();
        fs::write(dir.path().join("new.txt"), "n").unwrap();
        assert_eq!(tracker.changed_since("HEAD").unwrap(), vec!["a.txt", "new.txt"]);
    }

    #[test]
    fn test_diff_stats_counts_lines_from_merge_base() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "src.rs", "fn a() {}\n", "init");
        let base = tracker.head_sha().unwrap();
        commit_file(dir.path(), "src.rs", "fn b() {}\nfn c() {}\n", "change");
        commit_file(dir.path(), "docs/readme.md", "hi\n", "docs");

        let stats = tracker.diff_stats(&base, "HEAD").unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].path, "docs/readme.md");
        assert_eq!((stats[0].additions, stats[0].deletions), (1, 0));
        assert_eq!(stats[1].path, "src.rs");
        assert_eq!((stats[1].additions, stats[1].deletions), (2, 1));
    }
}
