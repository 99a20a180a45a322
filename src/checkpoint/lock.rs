use super::store::file_stem_for;
use crate::errors::ConductorError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on one run id.
///
/// The core assumes a single writer per run id; the CLI holds this lock for
/// the lifetime of any command that writes a checkpoint or evidence log.
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock without blocking.
    pub fn acquire(dir: &Path, run_id: &str) -> Result<Self, ConductorError> {
        fs::create_dir_all(dir).map_err(|e| ConductorError::store_io(dir, e))?;
        let path = dir.join(format!("{}.lock", file_stem_for(run_id)));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ConductorError::store_io(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            return Err(ConductorError::RunLocked {
                run_id: run_id.to_string(),
            });
        }

        tracing::debug!(run_id, path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let first = RunLock::acquire(dir.path(), "checkout").unwrap();
        let second = RunLock::acquire(dir.path(), "checkout");
        match second {
            Err(ConductorError::RunLocked { run_id }) => assert_eq!(run_id, "checkout"),
            other => panic!("Expected RunLocked, got {other:?}"),
        }
        drop(first);
        assert!(RunLock::acquire(dir.path(), "checkout").is_ok());
    }

    #[test]
    fn test_different_runs_do_not_conflict() {
        let dir = tempdir().unwrap();
        let _a = RunLock::acquire(dir.path(), "a").unwrap();
        let b = RunLock::acquire(dir.path(), "b").unwrap();
        assert!(b.path().ends_with("b.lock"));
    }
}
