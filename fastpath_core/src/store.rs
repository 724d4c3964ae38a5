//! Record store for fasting sessions and goal definitions.
//!
//! Everything lives in a single JSON document:
//!
//! ```json
//! { "records": [...], "goals": [...], "selected_goal": "16-Hour Fast" }
//! ```
//!
//! The selected goal is a pointer (goal name) kept apart from the goal
//! definitions, so clearing a selection never deletes any definition.
//!
//! Writes are load-modify-save under an exclusive lock on a sidecar lock
//! file, and the document is replaced atomically (temp file + rename). This
//! serializes writers across processes, so the one-active-record rule holds
//! even when the CLI and the tray write concurrently.

use crate::{Error, FastingGoal, FastingRecord, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Durable CRUD storage consumed by the fasting runtime
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Fails if it is active while another record is active.
    fn save(&self, record: &FastingRecord) -> Result<()>;

    /// Replace an existing record with the same id. Only an active record can
    /// be updated, and its start time must stay the same.
    fn update(&self, record: &FastingRecord) -> Result<()>;

    /// Remove a record; returns whether anything was removed
    fn delete(&self, id: Uuid) -> Result<bool>;

    /// All records, newest start time first
    fn list_all(&self) -> Result<Vec<FastingRecord>>;

    /// The record without an end time, if any
    fn get_active(&self) -> Result<Option<FastingRecord>>;

    /// Insert or replace a goal definition keyed by name
    fn save_goal(&self, goal: &FastingGoal) -> Result<()>;

    fn goals(&self) -> Result<Vec<FastingGoal>>;

    fn goal_by_name(&self, name: &str) -> Result<Option<FastingGoal>>;

    /// Point the selection at a stored goal, or clear it with `None`
    fn select_goal(&self, name: Option<&str>) -> Result<()>;

    fn selected_goal(&self) -> Result<Option<FastingGoal>>;

    /// Insert `goals` only when no goal definitions exist yet.
    /// Returns how many were inserted.
    fn seed_goals(&self, goals: &[FastingGoal]) -> Result<usize>;

    /// Records and goals as of one version of the store
    fn snapshot(&self) -> Result<StoreSnapshot>;
}

/// Everything the runtime loads, read under a single lock
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreSnapshot {
    pub active: Option<FastingRecord>,
    /// Newest start time first
    pub records: Vec<FastingRecord>,
    pub goals: Vec<FastingGoal>,
    pub selected_goal: Option<FastingGoal>,
}

// ============================================================================
// Document and mutation rules
// ============================================================================

/// The persisted document shared by every store backend
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreDocument {
    #[serde(default)]
    pub records: Vec<FastingRecord>,
    #[serde(default)]
    pub goals: Vec<FastingGoal>,
    #[serde(default)]
    pub selected_goal: Option<String>,
}

impl StoreDocument {
    fn active_record(&self) -> Option<&FastingRecord> {
        self.records.iter().find(|r| r.is_active())
    }

    fn insert_record(&mut self, record: &FastingRecord) -> Result<()> {
        if self.records.iter().any(|r| r.id == record.id) {
            return Err(Error::DuplicateRecord(record.id));
        }
        if record.is_active() {
            if let Some(active) = self.active_record() {
                return Err(Error::ActiveRecordExists(active.id));
            }
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn replace_record(&mut self, record: &FastingRecord) -> Result<()> {
        if record.is_active() {
            if let Some(active) = self.records.iter().find(|r| r.is_active() && r.id != record.id)
            {
                return Err(Error::ActiveRecordExists(active.id));
            }
        }
        let slot = self
            .records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or(Error::RecordNotFound(record.id))?;
        if slot.end_time.is_some() {
            return Err(Error::RecordAlreadyStopped(record.id));
        }
        if slot.start_time != record.start_time {
            return Err(Error::StartTimeChanged(record.id));
        }
        *slot = record.clone();
        Ok(())
    }

    fn remove_record(&mut self, id: Uuid) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        self.records.len() != before
    }

    fn sorted_records(&self) -> Vec<FastingRecord> {
        let mut records = self.records.clone();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    fn find_goal(&self, name: &str) -> Option<&FastingGoal> {
        self.goals.iter().find(|g| g.name == name)
    }

    fn upsert_goal(&mut self, goal: &FastingGoal) -> Result<()> {
        goal.validate()?;
        match self.goals.iter_mut().find(|g| g.name == goal.name) {
            Some(existing) => *existing = goal.clone(),
            None => self.goals.push(goal.clone()),
        }
        Ok(())
    }

    fn set_selected(&mut self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => {
                if self.find_goal(name).is_none() {
                    return Err(Error::GoalNotFound(name.to_string()));
                }
                self.selected_goal = Some(name.to_string());
            }
            None => self.selected_goal = None,
        }
        Ok(())
    }

    fn selected(&self) -> Option<FastingGoal> {
        self.selected_goal
            .as_deref()
            .and_then(|name| self.find_goal(name))
            .cloned()
    }

    fn seed(&mut self, goals: &[FastingGoal]) -> Result<usize> {
        if !self.goals.is_empty() {
            return Ok(0);
        }
        for goal in goals {
            self.upsert_goal(goal)?;
        }
        Ok(self.goals.len())
    }
}

/// Storage backend holding a [`StoreDocument`]
///
/// Every backend gets the full [`RecordStore`] contract from the shared
/// document rules.
pub trait DocumentBackend: Send + Sync {
    fn load_document(&self) -> Result<StoreDocument>;

    /// Apply `f` to the current document and persist the result atomically.
    /// Nothing is written when `f` fails.
    fn modify_document(
        &self,
        f: &mut dyn FnMut(&mut StoreDocument) -> Result<()>,
    ) -> Result<()>;
}

impl<B: DocumentBackend> RecordStore for B {
    fn save(&self, record: &FastingRecord) -> Result<()> {
        self.modify_document(&mut |doc| doc.insert_record(record))?;
        tracing::debug!("Saved fasting record {}", record.id);
        Ok(())
    }

    fn update(&self, record: &FastingRecord) -> Result<()> {
        self.modify_document(&mut |doc| doc.replace_record(record))?;
        tracing::debug!("Updated fasting record {}", record.id);
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<bool> {
        let mut removed = false;
        self.modify_document(&mut |doc| {
            removed = doc.remove_record(id);
            Ok(())
        })?;
        tracing::debug!("Delete of fasting record {} removed={}", id, removed);
        Ok(removed)
    }

    fn list_all(&self) -> Result<Vec<FastingRecord>> {
        Ok(self.load_document()?.sorted_records())
    }

    fn get_active(&self) -> Result<Option<FastingRecord>> {
        Ok(self.load_document()?.active_record().cloned())
    }

    fn save_goal(&self, goal: &FastingGoal) -> Result<()> {
        self.modify_document(&mut |doc| doc.upsert_goal(goal))
    }

    fn goals(&self) -> Result<Vec<FastingGoal>> {
        Ok(self.load_document()?.goals)
    }

    fn goal_by_name(&self, name: &str) -> Result<Option<FastingGoal>> {
        Ok(self.load_document()?.find_goal(name).cloned())
    }

    fn select_goal(&self, name: Option<&str>) -> Result<()> {
        self.modify_document(&mut |doc| doc.set_selected(name))
    }

    fn selected_goal(&self) -> Result<Option<FastingGoal>> {
        Ok(self.load_document()?.selected())
    }

    fn seed_goals(&self, goals: &[FastingGoal]) -> Result<usize> {
        if !self.load_document()?.goals.is_empty() {
            return Ok(0);
        }
        let mut inserted = 0;
        self.modify_document(&mut |doc| {
            inserted = doc.seed(goals)?;
            Ok(())
        })?;
        if inserted > 0 {
            tracing::info!("Seeded {} predefined goals", inserted);
        }
        Ok(inserted)
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let doc = self.load_document()?;
        Ok(StoreSnapshot {
            active: doc.active_record().cloned(),
            records: doc.sorted_records(),
            selected_goal: doc.selected(),
            goals: doc.goals,
        })
    }
}

// ============================================================================
// JSON file backend
// ============================================================================

/// JSON-file store with file locking
pub struct JsonStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonStore {
    /// Create a store backed by the document at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    /// Store at the standard location inside a data directory
    pub fn open_in(data_dir: &Path) -> Self {
        Self::new(crate::config::Config::store_path(data_dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open_lock_file(&self) -> Result<File> {
        self.ensure_parent_dir()?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        Ok(file)
    }

    fn read_raw(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(&self.path)?.read_to_string(&mut contents)?;
        Ok(Some(contents))
    }

    fn write_atomic(&self, doc: &StoreDocument) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "store path missing parent")
        })?;
        let temp = NamedTempFile::new_in(parent)?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, doc)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl DocumentBackend for JsonStore {
    /// Returns an empty document if the file doesn't exist.
    /// If the file is corrupted, logs a warning and returns an empty document.
    fn load_document(&self) -> Result<StoreDocument> {
        let lock = self.open_lock_file()?;
        lock.lock_shared()?;
        let raw = self.read_raw();
        lock.unlock()?;

        let Some(contents) = raw?.filter(|c| !c.trim().is_empty()) else {
            return Ok(StoreDocument::default());
        };

        match serde_json::from_str::<StoreDocument>(&contents) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse store {:?}: {}. Treating as empty.",
                    self.path,
                    e
                );
                Ok(StoreDocument::default())
            }
        }
    }

    /// A corrupted document is never overwritten: the parse error is returned.
    fn modify_document(
        &self,
        f: &mut dyn FnMut(&mut StoreDocument) -> Result<()>,
    ) -> Result<()> {
        let lock = self.open_lock_file()?;
        lock.lock_exclusive()?;

        let result = (|| {
            let mut doc = match self.read_raw()?.filter(|c| !c.trim().is_empty()) {
                Some(contents) => serde_json::from_str::<StoreDocument>(&contents)?,
                None => StoreDocument::default(),
            };
            f(&mut doc)?;
            self.write_atomic(&doc)
        })();

        lock.unlock()?;
        result
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-process store, used by tests and as a fallback
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<StoreDocument>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, StoreDocument> {
        match self.doc.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DocumentBackend for MemoryStore {
    fn load_document(&self) -> Result<StoreDocument> {
        Ok(self.guard().clone())
    }

    fn modify_document(
        &self,
        f: &mut dyn FnMut(&mut StoreDocument) -> Result<()>,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        let mut guard = self.guard();
        let mut doc = guard.clone();
        f(&mut doc)?;
        *guard = doc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 4, 20, 0, 0).unwrap()
    }

    fn json_store() -> (tempfile::TempDir, JsonStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open_in(temp_dir.path());
        (temp_dir, store)
    }

    fn check_single_active_rule(store: &dyn RecordStore) {
        let first = FastingRecord::new(t0());
        store.save(&first).unwrap();

        let second = FastingRecord::new(t0() + Duration::hours(1));
        let err = store.save(&second).unwrap_err();
        assert!(matches!(err, Error::ActiveRecordExists(id) if id == first.id));

        // Once stopped, a new fast may begin
        store.update(&first.stopped_at(t0() + Duration::hours(2))).unwrap();
        store.save(&second).unwrap();

        let active: Vec<_> = store
            .list_all()
            .unwrap()
            .into_iter()
            .filter(|r| r.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(store.get_active().unwrap().unwrap().id, second.id);

        // Re-opening the stopped record would create a second active one
        let reopened = FastingRecord {
            end_time: None,
            ..first.clone()
        };
        assert!(matches!(
            store.update(&reopened),
            Err(Error::ActiveRecordExists(_))
        ));
    }

    #[test]
    fn test_single_active_rule_json() {
        let (_dir, store) = json_store();
        check_single_active_rule(&store);
    }

    #[test]
    fn test_single_active_rule_memory() {
        check_single_active_rule(&MemoryStore::new());
    }

    #[test]
    fn test_list_all_newest_first() {
        let (_dir, store) = json_store();
        let older = FastingRecord::new(t0() - Duration::days(2)).stopped_at(t0() - Duration::days(1));
        let newer = FastingRecord::new(t0());
        store.save(&older).unwrap();
        store.save(&newer).unwrap();

        let records = store.list_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, newer.id);
        assert_eq!(records[1].id, older.id);
    }

    #[test]
    fn test_update_missing_record() {
        let store = MemoryStore::new();
        let record = FastingRecord::new(t0());
        assert!(matches!(
            store.update(&record),
            Err(Error::RecordNotFound(id)) if id == record.id
        ));
    }

    fn check_stopped_record_is_final(store: &dyn RecordStore) {
        let record = FastingRecord::new(t0() - Duration::days(3));
        store.save(&record).unwrap();
        let stopped = record.stopped_at(t0() - Duration::days(3) + Duration::hours(1));
        store.update(&stopped).unwrap();

        // A second stop must not move the end time
        let restopped = record.stopped_at(t0() - Duration::days(3) + Duration::hours(5));
        assert!(matches!(
            store.update(&restopped),
            Err(Error::RecordAlreadyStopped(id)) if id == record.id
        ));

        let reopened = FastingRecord {
            end_time: None,
            ..record.clone()
        };
        assert!(matches!(
            store.update(&reopened),
            Err(Error::RecordAlreadyStopped(_))
        ));
        assert_eq!(store.list_all().unwrap(), vec![stopped]);
    }

    #[test]
    fn test_stopped_record_is_final_json() {
        let (_dir, store) = json_store();
        check_stopped_record_is_final(&store);
    }

    #[test]
    fn test_stopped_record_is_final_memory() {
        check_stopped_record_is_final(&MemoryStore::new());
    }

    #[test]
    fn test_start_time_never_moves() {
        let store = MemoryStore::new();
        let record = FastingRecord::new(t0());
        store.save(&record).unwrap();

        let moved = FastingRecord {
            start_time: t0() - Duration::days(3),
            ..record.clone()
        };
        assert!(matches!(
            store.update(&moved),
            Err(Error::StartTimeChanged(id)) if id == record.id
        ));
        assert!(matches!(
            store.update(&moved.stopped_at(t0() + Duration::hours(1))),
            Err(Error::StartTimeChanged(_))
        ));
        assert_eq!(store.get_active().unwrap(), Some(record));
    }

    #[test]
    fn test_snapshot_reads_everything_together() {
        let (_dir, store) = json_store();
        store.seed_goals(crate::get_predefined_goals()).unwrap();
        store.select_goal(Some("18-Hour Fast")).unwrap();
        let older = FastingRecord::new(t0() - Duration::days(1)).stopped_at(t0() - Duration::hours(8));
        let active = FastingRecord::new(t0());
        store.save(&older).unwrap();
        store.save(&active).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.active, Some(active.clone()));
        assert_eq!(snapshot.records, vec![active, older]);
        assert_eq!(snapshot.goals.len(), 4);
        assert_eq!(snapshot.selected_goal.unwrap().name, "18-Hour Fast");
    }

    #[test]
    fn test_duplicate_save_rejected() {
        let store = MemoryStore::new();
        let record = FastingRecord::new(t0()).stopped_at(t0() + Duration::hours(1));
        store.save(&record).unwrap();
        assert!(matches!(store.save(&record), Err(Error::DuplicateRecord(_))));
    }

    #[test]
    fn test_delete_removes_from_list() {
        let (_dir, store) = json_store();
        let keep = FastingRecord::new(t0() - Duration::days(1)).stopped_at(t0());
        let gone = FastingRecord::new(t0() - Duration::days(3)).stopped_at(t0() - Duration::days(2));
        store.save(&keep).unwrap();
        store.save(&gone).unwrap();

        assert!(store.delete(gone.id).unwrap());
        assert!(!store.delete(gone.id).unwrap());

        let records = store.list_all().unwrap();
        assert_eq!(records, vec![keep]);
    }

    #[test]
    fn test_goal_upsert_by_name() {
        let (_dir, store) = json_store();
        store.save_goal(&FastingGoal::new("Custom", 3600)).unwrap();
        store.save_goal(&FastingGoal::new("Custom", 7200)).unwrap();

        let goals = store.goals().unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(
            store.goal_by_name("Custom").unwrap().unwrap().target_duration_secs,
            7200
        );
        assert!(store.goal_by_name("Missing").unwrap().is_none());
    }

    #[test]
    fn test_invalid_goal_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.save_goal(&FastingGoal::new("Zero", 0)),
            Err(Error::InvalidGoal(_))
        ));
        assert!(store.goals().unwrap().is_empty());
    }

    #[test]
    fn test_clearing_selection_keeps_definitions() {
        let (_dir, store) = json_store();
        store.seed_goals(crate::get_predefined_goals()).unwrap();
        store.select_goal(Some("16-Hour Fast")).unwrap();
        assert_eq!(
            store.selected_goal().unwrap().unwrap().target_duration_secs,
            57_600
        );

        store.select_goal(None).unwrap();
        assert!(store.selected_goal().unwrap().is_none());
        assert_eq!(store.goals().unwrap().len(), 4);
    }

    #[test]
    fn test_select_unknown_goal() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.select_goal(Some("Nope")),
            Err(Error::GoalNotFound(_))
        ));
    }

    #[test]
    fn test_seed_is_idempotent() {
        let (_dir, store) = json_store();
        assert_eq!(store.seed_goals(crate::get_predefined_goals()).unwrap(), 4);
        assert_eq!(store.seed_goals(crate::get_predefined_goals()).unwrap(), 0);
        assert_eq!(store.goals().unwrap().len(), 4);
    }

    #[test]
    fn test_persists_across_instances() {
        let temp_dir = tempfile::tempdir().unwrap();
        let record = FastingRecord::new(t0());
        JsonStore::open_in(temp_dir.path()).save(&record).unwrap();

        let reopened = JsonStore::open_in(temp_dir.path());
        assert_eq!(reopened.get_active().unwrap(), Some(record));
    }

    #[test]
    fn test_corrupted_document_reads_empty_but_refuses_writes() {
        let (_dir, store) = json_store();
        std::fs::write(store.path(), "{ invalid json }").unwrap();

        assert!(store.list_all().unwrap().is_empty());
        let result = store.save(&FastingRecord::new(t0()));
        assert!(matches!(result, Err(Error::Json(_))));

        // The corrupted file is left for manual recovery
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents, "{ invalid json }");
    }

    #[test]
    fn test_empty_document_is_treated_as_new() {
        let (_dir, store) = json_store();
        std::fs::write(store.path(), "\n").unwrap();

        assert!(store.list_all().unwrap().is_empty());
        store.save(&FastingRecord::new(t0())).unwrap();
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let (dir, store) = json_store();
        store.save(&FastingRecord::new(t0())).unwrap();

        let extras: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name != "fastpath.json" && name != "fastpath.json.lock")
            .collect();
        assert!(extras.is_empty(), "Unexpected files: {:?}", extras);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save(&FastingRecord::new(t0())),
            Err(Error::Io(_))
        ));
        store.set_fail_writes(false);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers_keep_one_active() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = JsonStore::open_in(&path);
                    store
                        .save(&FastingRecord::new(t0() + Duration::seconds(i)))
                        .is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 1);
        let store = JsonStore::open_in(&path);
        assert_eq!(store.list_all().unwrap().len(), 1);
    }
}
