use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use log::warn;
use tempfile::NamedTempFile;

use crate::error::{CoreError, CoreResult};
use crate::mission::{MissionId, MissionRecord};

const SNAPSHOT_EXT: &str = "json";

pub fn encode(record: &MissionRecord) -> CoreResult<String> {
    serde_json::to_string_pretty(record).map_err(|err| CoreError::Codec(err.to_string()))
}

pub fn decode(text: &str) -> CoreResult<MissionRecord> {
    serde_json::from_str(text).map_err(|err| CoreError::Codec(err.to_string()))
}

pub trait SnapshotStore: Send + Sync {
    fn save(&self, record: &MissionRecord) -> CoreResult<()>;
    fn load_all(&self) -> CoreResult<Vec<MissionRecord>>;
    fn delete(&self, id: &MissionId) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    records: Mutex<HashMap<MissionId, String>>,
}

impl MemorySnapshotStore {
    pub fn contains(&self, id: &MissionId) -> bool {
        self.records
            .lock()
            .map(|records| records.contains_key(id))
            .unwrap_or(false)
    }

    pub fn get(&self, id: &MissionId) -> Option<MissionRecord> {
        let records = self.records.lock().ok()?;
        records.get(id).and_then(|text| decode(text).ok())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, record: &MissionRecord) -> CoreResult<()> {
        let text = encode(record)?;
        self.records
            .lock()
            .map_err(|_| CoreError::Storage("snapshot lock poisoned".to_string()))?
            .insert(record.id, text);
        Ok(())
    }

    fn load_all(&self) -> CoreResult<Vec<MissionRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| CoreError::Storage("snapshot lock poisoned".to_string()))?;
        records.values().map(|text| decode(text)).collect()
    }

    fn delete(&self, id: &MissionId) -> CoreResult<()> {
        self.records
            .lock()
            .map_err(|_| CoreError::Storage("snapshot lock poisoned".to_string()))?
            .remove(id);
        Ok(())
    }
}

/// One `<id>.json` file per mission inside the task directory.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &MissionId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SNAPSHOT_EXT))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, record: &MissionRecord) -> CoreResult<()> {
        let text = encode(record)?;
        fs::create_dir_all(&self.dir).map_err(|err| CoreError::Io(err.to_string()))?;
        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|err| CoreError::Io(err.to_string()))?;
        tmp.write_all(text.as_bytes())
            .map_err(|err| CoreError::Io(err.to_string()))?;
        tmp.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        tmp.persist(self.path_for(&record.id))
            .map_err(|err| CoreError::Io(err.error.to_string()))?;
        Ok(())
    }

    fn load_all(&self) -> CoreResult<Vec<MissionRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir).map_err(|err| CoreError::Io(err.to_string()))?;
                return Ok(Vec::new());
            }
            Err(err) => return Err(CoreError::Io(err.to_string())),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CoreError::Io(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() || path.extension().and_then(|ext| ext.to_str()) != Some(SNAPSHOT_EXT)
            {
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    warn!("skipping unreadable snapshot {}: {}", path.display(), err);
                    continue;
                }
            };
            if text.trim().is_empty() {
                continue;
            }
            match decode(&text) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping corrupt snapshot {}: {}", path.display(), err),
            }
        }
        Ok(records)
    }

    fn delete(&self, id: &MissionId) -> CoreResult<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::Io(err.to_string())),
        }
    }
}

const GATE_IDLE: u8 = 0;
const GATE_IN_FLIGHT: u8 = 1;
const GATE_DIRTY: u8 = 2;

/// Single-flight gate for debounced snapshot writes.
///
/// `request` returns `true` when the caller has to start a writer. A request
/// that lands while a write is in flight marks the gate dirty, and `complete`
/// then tells the writer to run exactly one more pass.
#[derive(Debug, Default)]
pub struct WriteGate {
    state: AtomicU8,
}

impl WriteGate {
    pub fn request(&self) -> bool {
        loop {
            match self.state.load(Ordering::SeqCst) {
                GATE_IDLE => {
                    if self
                        .state
                        .compare_exchange(GATE_IDLE, GATE_IN_FLIGHT, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return true;
                    }
                }
                GATE_IN_FLIGHT => {
                    if self
                        .state
                        .compare_exchange(
                            GATE_IN_FLIGHT,
                            GATE_DIRTY,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Called by the writer after each pass; `true` means write again.
    pub fn complete(&self) -> bool {
        loop {
            match self.state.load(Ordering::SeqCst) {
                GATE_DIRTY => {
                    if self
                        .state
                        .compare_exchange(GATE_DIRTY, GATE_IN_FLIGHT, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return true;
                    }
                }
                GATE_IN_FLIGHT => {
                    if self
                        .state
                        .compare_exchange(GATE_IN_FLIGHT, GATE_IDLE, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::SeqCst) == GATE_IDLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::TempDir;

    fn sample_record() -> MissionRecord {
        let mut record = MissionRecord::new(
            "http://example.com/files/archive.zip".to_string(),
            "/downloads".to_string(),
            1000,
            3,
            "blockdl-test".to_string(),
        );
        record.name = "archive.zip".to_string();
        record.redirect_url = "http://cdn.example.com/archive.zip".to_string();
        record.cookie = "session=abc".to_string();
        record.length = 4500;
        record.block_count = 5;
        record.done = 2000;
        record.worker_cursors = vec![3, 1, 2];
        record.completed_blocks = [0u64, 4].into_iter().collect();
        record.has_init = true;
        record.recovered = true;
        record.error = Some(ErrorCode::NoSpace);
        record
    }

    #[test]
    fn codec_preserves_every_field() {
        let record = sample_record();
        let text = encode(&record).unwrap();
        assert!(text.contains("\"completed_blocks\""));
        assert_eq!(decode(&text).unwrap(), record);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode("{not json"), Err(CoreError::Codec(_))));
    }

    #[test]
    fn file_store_saves_loads_and_deletes() {
        let temp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(temp.path().join("tasks")).unwrap();
        let record = sample_record();

        store.save(&record).unwrap();
        assert!(store.path_for(&record.id).is_file());

        // Stray files are ignored, corrupt snapshots skipped.
        fs::write(store.dir().join("notes.txt"), "hello").unwrap();
        fs::write(store.dir().join("broken.json"), "{").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![record.clone()]);

        store.delete(&record.id).unwrap();
        assert!(!store.path_for(&record.id).exists());
        store.delete(&record.id).unwrap();
    }

    #[test]
    fn gate_coalesces_requests_into_one_follow_up() {
        let gate = WriteGate::default();
        assert!(gate.request());
        assert!(!gate.request());
        assert!(!gate.request());

        // The dirty mark yields exactly one more pass.
        assert!(gate.complete());
        assert!(!gate.complete());
        assert!(gate.is_idle());

        assert!(gate.request());
        assert!(!gate.complete());
        assert!(gate.is_idle());
    }
}
