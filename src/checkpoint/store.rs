use super::Checkpoint;
use crate::errors::ConductorError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistence for checkpoints, one per run id.
///
/// Single writer per run id is assumed; see `RunLock`.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for `run_id`, or an empty one if none exists.
    fn load(&self, run_id: &str) -> Result<Checkpoint, ConductorError>;

    /// Replace the stored checkpoint. Readers never observe a partial write.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConductorError>;

    /// Remove the stored checkpoint. Returns whether one existed.
    fn clear(&self, run_id: &str) -> Result<bool, ConductorError>;
}

/// Map a run id onto a safe file stem.
///
/// Ids made only of `[A-Za-z0-9._-]` map to themselves. Anything else is
/// sanitised and suffixed with a digest of the raw id, so `a/b` and `a_b`
/// never share a file.
pub(crate) fn file_stem_for(run_id: &str) -> String {
    let sanitised: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if sanitised.is_empty() || sanitised.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        sanitised
    };
    if stem == run_id {
        return stem;
    }
    let digest = Sha256::digest(run_id.as_bytes());
    let suffix: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("{stem}-{suffix}")
}

/// JSON checkpoint files under a directory.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(run_id)))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, run_id: &str) -> Result<Checkpoint, ConductorError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(Checkpoint::new(run_id));
        }

        let content =
            fs::read_to_string(&path).map_err(|e| ConductorError::store_io(&path, e))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            ConductorError::serialization(format!("checkpoint {}", path.display()), e)
        })?;
        if checkpoint.run_id != run_id {
            return Err(ConductorError::CheckpointMismatch {
                path,
                expected: run_id.to_string(),
                found: checkpoint.run_id,
            });
        }
        Ok(checkpoint)
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConductorError> {
        fs::create_dir_all(&self.dir).map_err(|e| ConductorError::store_io(&self.dir, e))?;

        let path = self.path_for(&checkpoint.run_id);
        let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| ConductorError::serialization("checkpoint", e))?;

        // Write-then-rename so a crash leaves either the old or the new file
        let write_tmp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        if let Err(e) = write_tmp() {
            let _ = fs::remove_file(&tmp);
            return Err(ConductorError::store_io(&tmp, e));
        }
        fs::rename(&tmp, &path).map_err(|e| ConductorError::store_io(&path, e))?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            completed = checkpoint.completed.len(),
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    fn clear(&self, run_id: &str) -> Result<bool, ConductorError> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| ConductorError::store_io(&path, e))?;
        Ok(true)
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    saves: Mutex<usize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, run_id: &str) -> Result<Checkpoint, ConductorError> {
        let map = self
            .checkpoints
            .lock()
            .map_err(|_| poisoned(run_id))?;
        Ok(map
            .get(run_id)
            .cloned()
            .unwrap_or_else(|| Checkpoint::new(run_id)))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), ConductorError> {
        self.checkpoints
            .lock()
            .map_err(|_| poisoned(&checkpoint.run_id))?
            .insert(checkpoint.run_id.clone(), checkpoint.clone());
        if let Ok(mut saves) = self.saves.lock() {
            *saves += 1;
        }
        Ok(())
    }

    fn clear(&self, run_id: &str) -> Result<bool, ConductorError> {
        Ok(self
            .checkpoints
            .lock()
            .map_err(|_| poisoned(run_id))?
            .remove(run_id)
            .is_some())
    }
}

fn poisoned(run_id: &str) -> ConductorError {
    ConductorError::store_io(
        format!("memory://{}", run_id),
        std::io::Error::other("checkpoint lock poisoned"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_store() -> (FileCheckpointStore, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let store = FileCheckpointStore::new(&dir.path().join("checkpoints"));
        (store, dir)
    }

    #[test]
    fn test_load_absent_returns_empty() {
        let (store, _dir) = setup_store();
        let cp = store.load("checkout").unwrap();
        assert!(cp.is_fresh());
        assert_eq!(cp.run_id, "checkout");
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (store, _dir) = setup_store();
        let mut cp = Checkpoint::new("checkout");
        cp.mark_completed("WS-01");
        cp.record_failure("WS-02");
        store.save(&cp).unwrap();

        let loaded = store.load("checkout").unwrap();
        assert_eq!(loaded.completed, vec!["WS-01"]);
        assert_eq!(loaded.retries_for("WS-02"), 1);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let (store, dir) = setup_store();
        store.save(&Checkpoint::new("checkout")).unwrap();
        store.save(&Checkpoint::new("checkout")).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path().join("checkpoints"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["checkout.json"]);
    }

    #[test]
    fn test_run_ids_are_sanitised() {
        let (store, _dir) = setup_store();
        let path = store.path_for("../feature/x y");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".._feature_x_y-"), "{name}");
        assert!(name.ends_with(".json"));
        assert!(path.starts_with(&store.dir));
        assert_eq!(store.path_for("checkout").file_name().unwrap(), "checkout.json");
    }

    #[test]
    fn test_distinct_run_ids_never_share_a_file() {
        let ids = ["a/b", "a_b", "a b", "", ".", "..", "_"];
        let stems: std::collections::BTreeSet<String> =
            ids.iter().map(|id| file_stem_for(id)).collect();
        assert_eq!(stems.len(), ids.len());
        assert_eq!(file_stem_for("a_b"), "a_b");
        assert_ne!(file_stem_for("a/b"), "a_b");
    }

    #[test]
    fn test_sanitised_run_ids_keep_separate_checkpoints() {
        let (store, _dir) = setup_store();
        let mut slashed = Checkpoint::new("a/b");
        slashed.mark_completed("WS-01");
        store.save(&slashed).unwrap();
        store.save(&Checkpoint::new("a_b")).unwrap();

        assert_eq!(store.load("a/b").unwrap().completed, vec!["WS-01"]);
        assert!(store.load("a_b").unwrap().is_fresh());
    }

    #[test]
    fn test_load_rejects_checkpoint_of_another_run() {
        let (store, _dir) = setup_store();
        fs::create_dir_all(&store.dir).unwrap();
        let foreign = serde_json::to_string(&Checkpoint::new("other")).unwrap();
        fs::write(store.path_for("checkout"), foreign).unwrap();

        let err = store.load("checkout").unwrap_err();
        assert!(matches!(
            err,
            ConductorError::CheckpointMismatch { ref expected, ref found, .. }
                if expected == "checkout" && found == "other"
        ));
        assert!(err.is_run_fatal());
    }

    #[test]
    fn test_corrupt_checkpoint_is_error() {
        let (store, _dir) = setup_store();
        fs::create_dir_all(&store.dir).unwrap();
        fs::write(store.path_for("bad"), "{not json").unwrap();
        let err = store.load("bad").unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn test_clear() {
        let (store, _dir) = setup_store();
        assert!(!store.clear("checkout").unwrap());
        store.save(&Checkpoint::new("checkout")).unwrap();
        assert!(store.clear("checkout").unwrap());
        assert!(store.load("checkout").unwrap().is_fresh());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        let mut cp = Checkpoint::new("f");
        cp.mark_completed("A");
        store.save(&cp).unwrap();
        assert_eq!(store.load("f").unwrap().completed, vec!["A"]);
        assert_eq!(store.save_count(), 1);
        assert!(store.clear("f").unwrap());
    }
}
