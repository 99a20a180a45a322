use super::EvidenceEvent;
use crate::errors::ConductorError;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Backing storage for an evidence chain.
///
/// Stores only persist and return records in append order. Linking and
/// verification live in `EvidenceLog` so a backend never has to know how
/// the chain is hashed.
pub trait EvidenceStore: Send + Sync {
    /// Every stored event, oldest first.
    ///
    /// A record that cannot be decoded is reported as `ChainCorruption`
    /// at its index.
    fn read_all(&self) -> Result<Vec<EvidenceEvent>, ConductorError>;

    /// Durably add one event after the current last one.
    fn append(&self, event: &EvidenceEvent) -> Result<(), ConductorError>;

    /// Human-readable location used in log lines and reports.
    fn location(&self) -> String;
}

/// One JSON object per line in a single file.
pub struct JsonlEvidenceStore {
    path: PathBuf,
}

impl JsonlEvidenceStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// The log file for `run_id` inside `dir`.
    pub fn for_run(dir: &Path, run_id: &str) -> Self {
        let stem = crate::checkpoint::file_stem_for(run_id);
        Self::new(&dir.join(format!("{stem}.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EvidenceStore for JsonlEvidenceStore {
    fn read_all(&self) -> Result<Vec<EvidenceEvent>, ConductorError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path).map_err(|e| ConductorError::store_io(&self.path, e))?;
        let reader = BufReader::new(file);
        let mut lines: Vec<String> = Vec::new();
        for line in reader.lines() {
            lines.push(line.map_err(|e| ConductorError::store_io(&self.path, e))?);
        }
        // A trailing newline after the last record is expected
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }

        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            let event: EvidenceEvent =
                serde_json::from_str(line).map_err(|e| ConductorError::ChainCorruption {
                    index,
                    reason: format!("record is not a valid event ({e}); truncated write?"),
                })?;
            events.push(event);
        }
        Ok(events)
    }

    fn append(&self, event: &EvidenceEvent) -> Result<(), ConductorError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| ConductorError::store_io(parent, e))?;
        }

        let mut line = serde_json::to_string(event)
            .map_err(|e| ConductorError::serialization("evidence event", e))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ConductorError::store_io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| ConductorError::store_io(&self.path, e))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Vec-backed store for tests and embedding.
#[derive(Default)]
pub struct MemoryEvidenceStore {
    events: Mutex<Vec<EvidenceEvent>>,
}

impl MemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with pre-existing (possibly tampered) events.
    pub fn with_events(events: Vec<EvidenceEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }
}

impl EvidenceStore for MemoryEvidenceStore {
    fn read_all(&self) -> Result<Vec<EvidenceEvent>, ConductorError> {
        self.events
            .lock()
            .map(|events| events.clone())
            .map_err(|_| poisoned())
    }

    fn append(&self, event: &EvidenceEvent) -> Result<(), ConductorError> {
        self.events
            .lock()
            .map_err(|_| poisoned())?
            .push(event.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

fn poisoned() -> ConductorError {
    ConductorError::store_io("memory", std::io::Error::other("evidence lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::GENESIS_HASH;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(prev: &str) -> EvidenceEvent {
        EvidenceEvent::new("run_started", json!({"run": "checkout"}), Utc::now(), prev)
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonlEvidenceStore::new(&dir.path().join("nope.jsonl"));
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_creates_parent_dirs_and_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let store = JsonlEvidenceStore::for_run(&dir.path().join("evidence"), "checkout");
        let first = event(GENESIS_HASH);
        let second = event(&first.hash);
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));

        let events = store.read_all().unwrap();
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn test_truncated_line_is_chain_corruption_at_index() {
        let dir = TempDir::new().unwrap();
        let store = JsonlEvidenceStore::new(&dir.path().join("run.jsonl"));
        let first = event(GENESIS_HASH);
        store.append(&first).unwrap();

        let mut content = fs::read_to_string(store.path()).unwrap();
        content.push_str("{\"type\":\"unit_comp");
        fs::write(store.path(), content).unwrap();

        match store.read_all() {
            Err(ConductorError::ChainCorruption { index, .. }) => assert_eq!(index, 1),
            other => panic!("Expected ChainCorruption, got {other:?}"),
        }
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryEvidenceStore::new();
        store.append(&event(GENESIS_HASH)).unwrap();
        assert_eq!(store.read_all().unwrap().len(), 1);
        assert_eq!(store.location(), "memory");
    }
}
