use crate::domain::models::{Melody, Movement, Task, Tempo, TempoHistoryEntry};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::remote_client::{ChangeKind, RemoteTable};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
pub const DEFAULT_NAMESPACE: &str = "tempofy";

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    connection.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Raw string blobs addressed by key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError>;

    /// Writes every entry or none of them.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), InfraError>;

    fn remove_many(&self, keys: &[&str]) -> Result<(), InfraError>;

    fn set(&self, key: &str, value: &str) -> Result<(), InfraError> {
        self.set_many(&[(key, value)])
    }
}

#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    db_path: PathBuf,
}

impl SqliteKeyValueStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        Connection::open(&self.db_path).map_err(InfraError::from)
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        let value = connection
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let now = Utc::now().to_rfc3339();
        for (key, value) in entries {
            transaction.execute(
                "INSERT INTO kv_store (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        for key in keys {
            transaction.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        }
        transaction.commit()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, InfraError> {
        self.entries
            .lock()
            .map_err(|error| InfraError::Storage(format!("key-value store lock poisoned: {error}")))
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), InfraError> {
        let mut stored = self.lock()?;
        for (key, value) in entries {
            stored.insert((*key).to_string(), (*value).to_string());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), InfraError> {
        let mut stored = self.lock()?;
        for key in keys {
            stored.remove(*key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    Tasks,
    Movements,
    Melodies,
    CurrentTempo,
    LastSync,
    TempoHistory,
    PendingSync,
}

impl StorageKey {
    pub const ALL: [StorageKey; 7] = [
        StorageKey::Tasks,
        StorageKey::Movements,
        StorageKey::Melodies,
        StorageKey::CurrentTempo,
        StorageKey::LastSync,
        StorageKey::TempoHistory,
        StorageKey::PendingSync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Movements => "movements",
            Self::Melodies => "melodies",
            Self::CurrentTempo => "current_tempo",
            Self::LastSync => "last_sync",
            Self::TempoHistory => "tempo_history",
            Self::PendingSync => "pending_sync",
        }
    }
}

/// A local change that has not reached the remote yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub kind: ChangeKind,
    pub table: RemoteTable,
    pub id: String,
}

impl PendingChange {
    pub fn new(kind: ChangeKind, table: RemoteTable, id: impl Into<String>) -> Self {
        Self {
            kind,
            table,
            id: id.into(),
        }
    }

    pub fn deleted(table: RemoteTable, id: impl Into<String>) -> Self {
        Self::new(ChangeKind::Delete, table, id)
    }

    fn same_record(&self, other: &PendingChange) -> bool {
        self.table == other.table && self.id == other.id
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub movements: Vec<Movement>,
    #[serde(default)]
    pub melodies: Vec<Melody>,
    #[serde(default)]
    pub current_tempo: Tempo,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
}

/// Typed, namespaced view over a [`KeyValueStore`].
///
/// Collection reads fail open: a missing or unreadable blob yields an empty
/// list and a warning. Writes always propagate their error.
pub struct LocalStore {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    pending_guard: Mutex<()>,
}

impl LocalStore {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.trim().is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace.trim().to_string()
        };
        Self {
            store,
            namespace,
            pending_guard: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryKeyValueStore::default()), DEFAULT_NAMESPACE)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, key: StorageKey) -> String {
        format!("{}_{}", self.namespace, key.as_str())
    }

    fn read_raw(&self, key: StorageKey) -> Result<Option<String>, InfraError> {
        self.store.get(&self.key(key))
    }

    fn read_json<T: DeserializeOwned>(&self, key: StorageKey) -> Result<Option<T>, InfraError> {
        match self.read_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn load_list<T: DeserializeOwned>(&self, key: StorageKey) -> Vec<T> {
        match self.read_json::<Vec<T>>(key) {
            Ok(items) => items.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(key = key.as_str(), %error, "failed to load collection, using empty list");
                Vec::new()
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: StorageKey, value: &T) -> Result<(), InfraError> {
        let payload = serde_json::to_string(value)?;
        self.store.set(&self.key(key), &payload)
    }

    fn write_entries(&self, entries: &[(StorageKey, String)]) -> Result<(), InfraError> {
        let keys = entries
            .iter()
            .map(|(key, _)| self.key(*key))
            .collect::<Vec<_>>();
        let pairs = keys
            .iter()
            .zip(entries)
            .map(|(key, (_, payload))| (key.as_str(), payload.as_str()))
            .collect::<Vec<_>>();
        self.store.set_many(&pairs)
    }

    /// Writes `entries` together with the pending-sync list, after dropping
    /// `settled` from it and queueing `queued`. A queued delete replaces any
    /// other pending change of the same record and is never replaced itself.
    fn write_with_pending(
        &self,
        mut entries: Vec<(StorageKey, String)>,
        settled: &[PendingChange],
        queued: &[PendingChange],
    ) -> Result<(), InfraError> {
        let _guard = self
            .pending_guard
            .lock()
            .map_err(|error| InfraError::Storage(format!("pending sync lock poisoned: {error}")))?;

        let mut pending = self.pending_sync();
        pending.retain(|entry| !settled.contains(entry));
        for entry in queued {
            match pending.iter().position(|existing| existing.same_record(entry)) {
                Some(index) if pending[index].kind == ChangeKind::Delete => {}
                Some(index) => pending[index] = entry.clone(),
                None => pending.push(entry.clone()),
            }
        }
        entries.push((StorageKey::PendingSync, serde_json::to_string(&pending)?));
        self.write_entries(&entries)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.load_list(StorageKey::Tasks)
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<(), InfraError> {
        self.write_json(StorageKey::Tasks, tasks)
    }

    /// Persists the task list and queues `queued` for the remote in one write.
    pub fn save_tasks_with_pending(
        &self,
        tasks: &[Task],
        queued: &[PendingChange],
    ) -> Result<(), InfraError> {
        let entries = vec![(StorageKey::Tasks, serde_json::to_string(tasks)?)];
        self.write_with_pending(entries, &[], queued)
    }

    pub fn movements(&self) -> Vec<Movement> {
        self.load_list(StorageKey::Movements)
    }

    pub fn save_movements(&self, movements: &[Movement]) -> Result<(), InfraError> {
        self.write_json(StorageKey::Movements, movements)
    }

    /// Persists both lists in one atomic write.
    pub fn save_tasks_and_movements(
        &self,
        tasks: &[Task],
        movements: &[Movement],
    ) -> Result<(), InfraError> {
        self.write_entries(&[
            (StorageKey::Tasks, serde_json::to_string(tasks)?),
            (StorageKey::Movements, serde_json::to_string(movements)?),
        ])
    }

    pub fn save_tasks_and_movements_with_pending(
        &self,
        tasks: &[Task],
        movements: &[Movement],
        queued: &[PendingChange],
    ) -> Result<(), InfraError> {
        let entries = vec![
            (StorageKey::Tasks, serde_json::to_string(tasks)?),
            (StorageKey::Movements, serde_json::to_string(movements)?),
        ];
        self.write_with_pending(entries, &[], queued)
    }

    pub fn pending_sync(&self) -> Vec<PendingChange> {
        self.load_list(StorageKey::PendingSync)
    }

    /// Records the outcome of a push in one write: `settled` leaves the
    /// pending list, `failed` stays queued and `last_sync` becomes
    /// `collected_at`, the moment the pushed batch was read.
    pub fn settle_pending(
        &self,
        settled: &[PendingChange],
        failed: &[PendingChange],
        collected_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let entries = vec![(StorageKey::LastSync, serde_json::to_string(&collected_at)?)];
        self.write_with_pending(entries, settled, failed)
    }

    pub fn melodies(&self) -> Vec<Melody> {
        self.load_list(StorageKey::Melodies)
    }

    pub fn save_melodies(&self, melodies: &[Melody]) -> Result<(), InfraError> {
        self.write_json(StorageKey::Melodies, melodies)
    }

    pub fn tempo_history(&self) -> Vec<TempoHistoryEntry> {
        self.load_list(StorageKey::TempoHistory)
    }

    /// Persists the new current tempo together with its history in one write.
    pub fn save_tempo_change(
        &self,
        tempo: Tempo,
        history: &[TempoHistoryEntry],
    ) -> Result<(), InfraError> {
        self.write_entries(&[
            (StorageKey::CurrentTempo, serde_json::to_string(&tempo)?),
            (StorageKey::TempoHistory, serde_json::to_string(history)?),
        ])
    }

    pub fn current_tempo(&self) -> Tempo {
        match self.read_json::<Tempo>(StorageKey::CurrentTempo) {
            Ok(tempo) => tempo.unwrap_or_default(),
            Err(error) => {
                tracing::warn!(%error, "failed to load current tempo, using default");
                Tempo::default()
            }
        }
    }

    pub fn save_current_tempo(&self, tempo: Tempo) -> Result<(), InfraError> {
        self.write_json(StorageKey::CurrentTempo, &tempo)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        match self.read_json::<DateTime<Utc>>(StorageKey::LastSync) {
            Ok(last_sync) => last_sync,
            Err(error) => {
                tracing::warn!(%error, "invalid stored last sync time");
                None
            }
        }
    }

    pub fn export_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tasks: self.tasks(),
            movements: self.movements(),
            melodies: self.melodies(),
            current_tempo: self.current_tempo(),
            last_sync: self.last_sync(),
        }
    }

    /// Replaces the stored collections with the snapshot in one write,
    /// stamps `last_sync` with `imported_at` and drops pending sync work that
    /// referred to the replaced records.
    pub fn import_snapshot(
        &self,
        snapshot: &StoreSnapshot,
        imported_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let _guard = self
            .pending_guard
            .lock()
            .map_err(|error| InfraError::Storage(format!("pending sync lock poisoned: {error}")))?;
        self.write_entries(&[
            (StorageKey::Tasks, serde_json::to_string(&snapshot.tasks)?),
            (StorageKey::Movements, serde_json::to_string(&snapshot.movements)?),
            (StorageKey::Melodies, serde_json::to_string(&snapshot.melodies)?),
            (StorageKey::CurrentTempo, serde_json::to_string(&snapshot.current_tempo)?),
            (StorageKey::LastSync, serde_json::to_string(&imported_at)?),
            (StorageKey::PendingSync, "[]".to_string()),
        ])
    }

    pub fn clear_all(&self) -> Result<(), InfraError> {
        let keys = StorageKey::ALL.map(|key| self.key(key));
        let key_refs = keys.iter().map(String::as_str).collect::<Vec<_>>();
        self.store.remove_many(&key_refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::energy_boost;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "tempofy-storage-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("tempofy.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: "Buy milk".to_string(),
            description: None,
            tempo_required: Tempo::Adagio,
            completed: false,
            movement_id: None,
            priority: 2,
            estimated_minutes: 15,
            energy_boost: energy_boost(2, 15),
            created_at: fixed_time("2026-02-16T08:00:00Z"),
            completed_at: None,
            updated_at: fixed_time("2026-02-16T08:00:00Z"),
        }
    }

    #[test]
    fn sqlite_store_roundtrips_and_overwrites() {
        let database = TempDatabase::new();
        let store = SqliteKeyValueStore::new(&database.path);

        assert_eq!(store.get("missing").expect("get missing"), None);
        store.set("k", "one").expect("set one");
        store.set("k", "two").expect("set two");
        assert_eq!(store.get("k").expect("get k"), Some("two".to_string()));

        store
            .set_many(&[("a", "1"), ("b", "2")])
            .expect("set many");
        store.remove_many(&["a", "k"]).expect("remove many");
        assert_eq!(store.get("a").expect("get a"), None);
        assert_eq!(store.get("b").expect("get b"), Some("2".to_string()));
    }

    #[test]
    fn local_store_persists_tasks_across_instances() {
        let database = TempDatabase::new();
        let tasks = vec![sample_task("tsk-1"), sample_task("tsk-2")];
        {
            let store = LocalStore::new(
                Arc::new(SqliteKeyValueStore::new(&database.path)),
                DEFAULT_NAMESPACE,
            );
            store.save_tasks(&tasks).expect("save tasks");
        }
        let reopened = LocalStore::new(
            Arc::new(SqliteKeyValueStore::new(&database.path)),
            DEFAULT_NAMESPACE,
        );
        assert_eq!(reopened.tasks(), tasks);
    }

    #[test]
    fn keys_are_scoped_by_namespace() {
        let raw = Arc::new(InMemoryKeyValueStore::default());
        let first = LocalStore::new(raw.clone(), "install-a");
        let second = LocalStore::new(raw.clone(), "install-b");

        first.save_tasks(&[sample_task("tsk-1")]).expect("save tasks");
        assert_eq!(first.tasks().len(), 1);
        assert!(second.tasks().is_empty());
        assert!(raw.get("install-a_tasks").expect("raw get").is_some());
    }

    #[test]
    fn corrupt_collection_reads_fail_open() {
        let raw = Arc::new(InMemoryKeyValueStore::default());
        raw.set("tempofy_tasks", "{not json").expect("seed corrupt data");
        raw.set("tempofy_current_tempo", "presto").expect("seed bad tempo");
        raw.set("tempofy_last_sync", "yesterday").expect("seed bad time");
        let store = LocalStore::new(raw, DEFAULT_NAMESPACE);

        assert!(store.tasks().is_empty());
        assert_eq!(store.current_tempo(), Tempo::Moderato);
        assert_eq!(store.last_sync(), None);
    }

    #[test]
    fn current_tempo_and_last_sync_roundtrip() {
        let store = LocalStore::in_memory();
        assert_eq!(store.current_tempo(), Tempo::Moderato);
        store.save_current_tempo(Tempo::Adagio).expect("save tempo");
        assert_eq!(store.current_tempo(), Tempo::Adagio);

        let time = fixed_time("2026-02-16T08:00:00Z");
        store.settle_pending(&[], &[], time).expect("save last sync");
        assert_eq!(store.last_sync(), Some(time));
    }

    #[test]
    fn scalar_keys_are_stored_as_json() {
        let raw = Arc::new(InMemoryKeyValueStore::default());
        let store = LocalStore::new(raw.clone(), DEFAULT_NAMESPACE);
        store.save_current_tempo(Tempo::Adagio).expect("save tempo");
        store
            .settle_pending(&[], &[], fixed_time("2026-02-16T08:00:00Z"))
            .expect("save last sync");

        assert_eq!(
            raw.get("tempofy_current_tempo").expect("raw tempo"),
            Some("\"adagio\"".to_string())
        );
        let stored_sync = raw
            .get("tempofy_last_sync")
            .expect("raw last sync")
            .expect("last sync present");
        let decoded: DateTime<Utc> = serde_json::from_str(&stored_sync).expect("json timestamp");
        assert_eq!(decoded, fixed_time("2026-02-16T08:00:00Z"));
    }

    #[test]
    fn queued_deletes_are_written_with_the_list_and_win_over_other_changes() {
        let store = LocalStore::in_memory();
        let created = PendingChange::new(ChangeKind::Create, RemoteTable::Tasks, "tsk-1");
        store
            .settle_pending(&[], &[created.clone()], fixed_time("2026-02-16T08:00:00Z"))
            .expect("queue failed create");
        assert_eq!(store.pending_sync(), vec![created.clone()]);

        let deleted = PendingChange::deleted(RemoteTable::Tasks, "tsk-1");
        store
            .save_tasks_with_pending(&[], &[deleted.clone()])
            .expect("delete task");
        assert_eq!(store.pending_sync(), vec![deleted.clone()]);

        store
            .settle_pending(&[], &[created], fixed_time("2026-02-16T09:00:00Z"))
            .expect("requeue create");
        assert_eq!(store.pending_sync(), vec![deleted.clone()]);

        store
            .settle_pending(&[deleted], &[], fixed_time("2026-02-16T10:00:00Z"))
            .expect("settle delete");
        assert!(store.pending_sync().is_empty());
        assert_eq!(store.last_sync(), Some(fixed_time("2026-02-16T10:00:00Z")));
    }

    #[test]
    fn movement_delete_is_queued_and_import_resets_pending() {
        let store = LocalStore::in_memory();
        let movement_delete = PendingChange::deleted(RemoteTable::Movements, "mvt-1");
        store
            .save_tasks_and_movements_with_pending(&[sample_task("tsk-1")], &[], &[movement_delete.clone()])
            .expect("delete movement");
        assert_eq!(store.tasks().len(), 1);
        assert_eq!(store.pending_sync(), vec![movement_delete]);

        store
            .import_snapshot(&StoreSnapshot::default(), fixed_time("2026-02-16T08:00:00Z"))
            .expect("import");
        assert!(store.pending_sync().is_empty());
    }

    #[test]
    fn snapshot_import_export_and_clear() {
        let store = LocalStore::in_memory();
        let snapshot = StoreSnapshot {
            tasks: vec![sample_task("tsk-1")],
            movements: Vec::new(),
            melodies: Vec::new(),
            current_tempo: Tempo::Allegro,
            last_sync: None,
        };
        let imported_at = fixed_time("2026-02-16T09:00:00Z");
        store
            .import_snapshot(&snapshot, imported_at)
            .expect("import snapshot");

        let exported = store.export_snapshot();
        assert_eq!(exported.tasks, snapshot.tasks);
        assert_eq!(exported.current_tempo, Tempo::Allegro);
        assert_eq!(exported.last_sync, Some(imported_at));

        store.clear_all().expect("clear all");
        assert_eq!(store.export_snapshot(), StoreSnapshot::default());
    }
}
