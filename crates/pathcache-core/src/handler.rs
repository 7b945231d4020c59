//! Per-type cache engine.
//!
//! A [`TypeHandler`] owns the path tree of one record type and its files under
//! `base_dir`. Every method assumes exclusive access; the [`Cache`] registry
//! grants it by holding the type's lock for the duration of the call.
//!
//! [`Cache`]: crate::Cache

use crate::config::HandlerConfig;
use crate::error::{CacheError, Result};
use crate::path::CachePath;
use crate::record::{now_millis, Cacheable, RecordCodec, RecordKind, Shared};
use crate::storage;
use crate::tree::PathTree;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};
use walkdir::WalkDir;

/// Cache engine for one record type.
pub struct TypeHandler<K: RecordKind> {
    kind: K,
    codec: Option<Box<dyn RecordCodec<K>>>,
    base_dir: PathBuf,
    ttl: Duration,
    tree: PathTree<K::Record>,
}

impl<K: RecordKind> TypeHandler<K> {
    /// Create a handler storing files under `base_dir`.
    ///
    /// The handler needs a codec (see [`with_codec`](Self::with_codec))
    /// before it can be registered.
    pub fn new(kind: K, base_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            kind,
            codec: None,
            base_dir: base_dir.into(),
            ttl,
            tree: PathTree::new(),
        }
    }

    pub fn from_config(kind: K, config: &HandlerConfig) -> Self {
        Self::new(kind, config.base_dir.clone(), config.ttl())
    }

    /// Supply the construction and (de)serialization hooks.
    pub fn with_codec(mut self, codec: impl RecordCodec<K> + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    pub fn has_codec(&self) -> bool {
        self.codec.is_some()
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of records currently resident in memory.
    pub fn resident_count(&self) -> usize {
        self.tree.len()
    }

    /// Number of intermediate nodes in the path tree.
    pub fn branch_count(&self) -> usize {
        self.tree.branch_count()
    }

    /// Durable file location of `path`.
    pub fn record_file(&self, path: &CachePath) -> Result<PathBuf> {
        path.file(&self.base_dir)
    }

    /// Whether a durable file exists for `descriptor`.
    ///
    /// Looks at the file system only; creates nothing.
    pub fn exists(&self, descriptor: &K::Descriptor) -> Result<bool> {
        let path = self.kind.descriptor_path(descriptor);
        Ok(self.record_file(&path)?.is_file())
    }

    /// Fetch the record for `descriptor` if it was ever persisted.
    pub fn get(&mut self, descriptor: &K::Descriptor) -> Result<Option<Shared<K::Record>>> {
        if !self.exists(descriptor)? {
            return Ok(None);
        }
        self.get_or_create(descriptor).map(Some)
    }

    /// Fetch the record for `descriptor`, creating and persisting its default
    /// state on first access.
    pub fn get_or_create(&mut self, descriptor: &K::Descriptor) -> Result<Shared<K::Record>> {
        let path = self.kind.descriptor_path(descriptor);

        if let Some(record) = self.tree.resolve(&path) {
            record.lock().touch(now_millis());
            return Ok(Arc::clone(record));
        }

        let file = self.record_file(&path)?;
        self.tree.check_shape(&path).map_err(|e| self.tagged(e))?;

        let dir = path.directory(&self.base_dir);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io_with_path(e, &dir))?;

        if !file.is_file() {
            let codec = self.codec()?;
            let record = codec.new_default(descriptor);
            storage::write_map(&file, &codec.serialize(&record)?)?;
            debug!("Created default {} at {}", self.type_name(), file.display());
        }

        let mut record = self.load(&file)?.ok_or_else(|| CacheError::Io {
            message: format!("{} vanished before it could be loaded", file.display()),
            path: Some(file.clone()),
            source: None,
        })?;
        record.touch(now_millis());

        let shared = Arc::new(Mutex::new(record));
        self.tree
            .insert(&path, Arc::clone(&shared))
            .map_err(|e| self.tagged(e))?;
        Ok(shared)
    }

    /// Insert `record` at `path`, or remove whatever is there when `None`.
    ///
    /// Inserting with `persist` writes the record through before returning.
    /// Removing deletes the durable file and fires `on_delete`.
    ///
    /// Returns the inserted record, or the removed one.
    pub fn put(
        &mut self,
        record: Option<K::Record>,
        persist: bool,
        path: &CachePath,
    ) -> Result<Option<Shared<K::Record>>> {
        match record {
            Some(record) => self.insert(record, persist, path).map(Some),
            None => self.remove(path),
        }
    }

    /// Store `record` at its own path and write it through.
    pub fn set(&mut self, record: K::Record) -> Result<Shared<K::Record>> {
        let path = self.kind.record_path(&record);
        self.insert(record, true, &path)
    }

    /// Remove the record for `descriptor` if a durable file exists.
    pub fn delete(&mut self, descriptor: &K::Descriptor) -> Result<bool> {
        if !self.exists(descriptor)? {
            return Ok(false);
        }
        let path = self.kind.descriptor_path(descriptor);
        self.remove(&path)?;
        Ok(true)
    }

    /// Remove `record` at its own path.
    pub fn delete_record(&mut self, record: &Shared<K::Record>) -> Result<()> {
        let path = self.kind.record_path(&record.lock());
        self.remove(&path).map(|_| ())
    }

    fn insert(&mut self, mut record: K::Record, persist: bool, path: &CachePath) -> Result<Shared<K::Record>> {
        let file = self.record_file(path)?;
        self.tree.check_shape(path).map_err(|e| self.tagged(e))?;

        if persist {
            let map = self.codec()?.serialize(&record)?;
            storage::merge_and_write(&file, map)?;
        }

        record.touch(now_millis());
        let shared = Arc::new(Mutex::new(record));
        self.tree
            .insert(path, Arc::clone(&shared))
            .map_err(|e| self.tagged(e))?;
        Ok(shared)
    }

    fn remove(&mut self, path: &CachePath) -> Result<Option<Shared<K::Record>>> {
        let file = self.record_file(path)?;
        let removed = self.tree.remove(path);
        storage::remove_file(&file)?;
        debug!("Deleted {} at {}", self.type_name(), path);
        self.kind.on_delete(removed.as_ref(), path);
        Ok(removed)
    }

    /// Persist every resident record and empty the tree.
    ///
    /// Records that fail to save stay resident; the first failure is
    /// returned after every record was attempted.
    pub fn save_all(&mut self) -> Result<usize> {
        let codec = self.codec.as_deref().ok_or_else(|| self.missing_codec())?;
        let base_dir = &self.base_dir;
        let type_name = self.kind.type_name();
        let mut first_err = None;

        let saved = self.tree.retain(|path, record| {
            match save_record(codec, base_dir, path, record) {
                Ok(()) => false,
                Err(e) => {
                    error!("Failed to save {} at {}: {}", type_name, path, e);
                    first_err.get_or_insert(e);
                    true
                }
            }
        });

        match first_err {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// Save and evict every record idle since before `now_millis - ttl`.
    ///
    /// Returns the number of evicted records. A record that fails to save is
    /// kept; the first failure is returned after the full pass.
    pub fn check_all(&mut self, now_millis: i64) -> Result<usize> {
        let codec = self.codec.as_deref().ok_or_else(|| self.missing_codec())?;
        let base_dir = &self.base_dir;
        let type_name = self.kind.type_name();
        let ttl_millis = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let mut first_err = None;

        let evicted = self.tree.retain(|path, record| {
            let idle = record.lock().last_access().saturating_add(ttl_millis) < now_millis;
            if !idle {
                return true;
            }
            match save_record(codec, base_dir, path, record) {
                Ok(()) => {
                    debug!("Evicted idle {} at {}", type_name, path);
                    false
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                    true
                }
            }
        });

        match first_err {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    /// Load an independent copy of every record on disk.
    ///
    /// Bypasses the in-memory tree: unsaved changes to resident records are
    /// not reflected, and nothing becomes resident.
    pub fn copy_of_all(&self) -> Result<Vec<K::Record>> {
        if !self.base_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in WalkDir::new(&self.base_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| CacheError::Io {
                message: e.to_string(),
                path: e.path().map(Path::to_path_buf),
                source: e.into_io_error(),
            })?;
            if entry.file_type().is_file() && self.kind.is_valid(entry.path()) {
                if let Some(record) = self.load(entry.path())? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    fn load(&self, file: &Path) -> Result<Option<K::Record>> {
        let started = Instant::now();
        let Some(map) = storage::read_map(file).map_err(|e| self.corrupt(file, e))? else {
            return Ok(None);
        };
        let record = self
            .codec()?
            .deserialize(map)
            .map_err(|e| self.corrupt(file, e))?;
        debug!(
            "Loaded {} {} in {} micros",
            self.type_name(),
            file.display(),
            started.elapsed().as_micros()
        );
        Ok(Some(record))
    }

    fn codec(&self) -> Result<&dyn RecordCodec<K>> {
        self.codec.as_deref().ok_or_else(|| self.missing_codec())
    }

    fn missing_codec(&self) -> CacheError {
        CacheError::MissingCodec {
            type_name: self.type_name().to_string(),
        }
    }

    /// Turn parse and codec failures into a corruption error naming the file.
    fn corrupt(&self, file: &Path, err: CacheError) -> CacheError {
        match err {
            CacheError::Json { message, .. } | CacheError::Codec { message } => CacheError::Corrupt {
                type_name: self.type_name().to_string(),
                path: file.to_path_buf(),
                message,
            },
            other => other,
        }
    }

    fn tagged(&self, err: CacheError) -> CacheError {
        match err {
            CacheError::PathConflict { path, .. } => CacheError::PathConflict {
                type_name: self.type_name().to_string(),
                path,
            },
            other => other,
        }
    }
}

fn save_record<K: RecordKind>(
    codec: &dyn RecordCodec<K>,
    base_dir: &Path,
    path: &CachePath,
    record: &Shared<K::Record>,
) -> Result<()> {
    let map = codec.serialize(&record.lock())?;
    storage::merge_and_write(&path.file(base_dir)?, map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::testing::*;
    use crate::record::{SerdeCodec, StructuredMap};
    use tempfile::TempDir;

    fn handler(dir: &TempDir, ttl_secs: u64) -> TypeHandler<Players> {
        TypeHandler::new(Players, dir.path(), Duration::from_secs(ttl_secs)).with_codec(player_codec())
    }

    fn read_score(path: &Path) -> i64 {
        let map = storage::read_map(path).unwrap().unwrap();
        map["score"].as_i64().unwrap()
    }

    #[test]
    fn test_get_or_create_persists_default() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        let alice = PlayerId::new("alice");

        assert!(!handler.exists(&alice).unwrap());
        let record = handler.get_or_create(&alice).unwrap();
        assert_eq!(record.lock().id, "alice");
        assert!(record.lock().last_access() > 0);

        assert!(handler.exists(&alice).unwrap());
        assert!(dir.path().join("alice.dat").is_file());
        assert_eq!(handler.resident_count(), 1);
    }

    #[test]
    fn test_exists_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir, 60);

        assert!(!handler.exists(&PlayerId::in_region("eu", "bob")).unwrap());
        assert!(!dir.path().join("eu").exists());
        assert_eq!(handler.resident_count(), 0);
    }

    #[test]
    fn test_cache_hit_returns_same_instance_without_disk_io() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        let alice = PlayerId::new("alice");

        let first = handler.get_or_create(&alice).unwrap();
        first.lock().score = 10;

        // Remove the file behind the cache's back; a hit must not notice.
        fs::remove_file(dir.path().join("alice.dat")).unwrap();
        let second = handler.get_or_create(&alice).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().score, 10);
    }

    #[test]
    fn test_get_returns_none_without_file() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        assert!(handler.get(&PlayerId::new("ghost")).unwrap().is_none());
        assert!(!dir.path().join("ghost.dat").exists());
        assert_eq!(handler.resident_count(), 0);
    }

    #[test]
    fn test_get_loads_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("carol.dat"),
            r#"{ "id": "carol", "score": 7 }"#,
        )
        .unwrap();

        let mut handler = handler(&dir, 60);
        let record = handler.get(&PlayerId::new("carol")).unwrap().unwrap();
        assert_eq!(record.lock().score, 7);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("dave.dat"), r#"{ "id": 5 }"#).unwrap();

        let mut handler = handler(&dir, 60);
        let err = handler.get_or_create(&PlayerId::new("dave")).unwrap_err();
        match err {
            CacheError::Corrupt { type_name, path, .. } => {
                assert_eq!(type_name, "Player");
                assert!(path.ends_with("dave.dat"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(handler.resident_count(), 0);
    }

    #[test]
    fn test_set_writes_through() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);

        let record = handler
            .set(Player {
                id: "erin".into(),
                region: Some("eu".into()),
                score: 3,
                last_access: 0,
            })
            .unwrap();
        assert_eq!(read_score(&dir.path().join("eu").join("erin.dat")), 3);

        let fetched = handler.get_or_create(&PlayerId::in_region("eu", "erin")).unwrap();
        assert!(Arc::ptr_eq(&record, &fetched));
    }

    #[test]
    fn test_put_without_persist_stays_in_memory() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        let path = CachePath::new(["frank"]);

        let player = Player {
            id: "frank".into(),
            region: None,
            score: 1,
            last_access: 0,
        };
        let inserted = handler.put(Some(player), false, &path).unwrap().unwrap();
        assert_eq!(handler.resident_count(), 1);
        assert!(!dir.path().join("frank.dat").exists());

        let removed = handler.put(None, false, &path).unwrap().unwrap();
        assert!(Arc::ptr_eq(&inserted, &removed));
        assert_eq!(handler.resident_count(), 0);
    }

    #[test]
    fn test_delete_removes_memory_and_file() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        let bob = PlayerId::in_region("eu", "bob");

        handler.get_or_create(&bob).unwrap();
        assert_eq!(handler.branch_count(), 1);

        assert!(handler.delete(&bob).unwrap());
        assert!(!handler.exists(&bob).unwrap());
        assert!(handler.get(&bob).unwrap().is_none());
        assert_eq!(handler.resident_count(), 0);
        assert_eq!(handler.branch_count(), 0);
        // Directories are left in place.
        assert!(dir.path().join("eu").is_dir());

        assert!(!handler.delete(&bob).unwrap());
    }

    #[test]
    fn test_delete_record() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        let record = handler.get_or_create(&PlayerId::new("gina")).unwrap();

        handler.delete_record(&record).unwrap();
        assert!(!dir.path().join("gina.dat").exists());
        assert_eq!(handler.resident_count(), 0);
    }

    struct Tracked {
        deleted: Arc<Mutex<Vec<CachePath>>>,
    }

    impl RecordKind for Tracked {
        type Record = Player;
        type Descriptor = PlayerId;

        fn type_name(&self) -> &'static str {
            "TrackedPlayer"
        }

        fn descriptor_path(&self, descriptor: &PlayerId) -> CachePath {
            Players.descriptor_path(descriptor)
        }

        fn record_path(&self, record: &Player) -> CachePath {
            Players.record_path(record)
        }

        fn on_delete(&self, removed: Option<&Shared<Player>>, path: &CachePath) {
            assert!(removed.is_some());
            self.deleted.lock().push(path.clone());
        }
    }

    #[test]
    fn test_on_delete_hook_fires() {
        let dir = TempDir::new().unwrap();
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let codec = SerdeCodec::<Tracked, _>::new(|d: &PlayerId| Player {
            id: d.id.clone(),
            region: d.region.clone(),
            score: 0,
            last_access: 0,
        });
        let kind = Tracked {
            deleted: Arc::clone(&deleted),
        };
        let mut handler = TypeHandler::new(kind, dir.path(), Duration::from_secs(60)).with_codec(codec);

        handler.get_or_create(&PlayerId::new("hank")).unwrap();
        handler.delete(&PlayerId::new("hank")).unwrap();
        assert_eq!(*deleted.lock(), vec![CachePath::new(["hank"])]);
    }

    #[test]
    fn test_check_all_evicts_idle_and_prunes() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 1);

        let idle = handler.get_or_create(&PlayerId::in_region("eu", "ivy")).unwrap();
        let busy = handler.get_or_create(&PlayerId::new("jack")).unwrap();
        idle.lock().score = 42;

        let now = now_millis();
        idle.lock().touch(now - 5_000);
        busy.lock().touch(now);

        assert_eq!(handler.check_all(now + 500).unwrap(), 1);
        assert_eq!(handler.resident_count(), 1);
        assert_eq!(handler.branch_count(), 0);
        assert_eq!(read_score(&dir.path().join("eu").join("ivy.dat")), 42);

        // A second pass has nothing idle left within the TTL window.
        assert_eq!(handler.check_all(now + 500).unwrap(), 0);
        assert_eq!(handler.check_all(now + 1_001).unwrap(), 1);
        assert_eq!(handler.resident_count(), 0);
    }

    #[test]
    fn test_evicted_record_reloads_fresh_instance() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 1);
        let alice = PlayerId::new("alice");

        let first = handler.get_or_create(&alice).unwrap();
        first.lock().score = 10;
        handler.check_all(now_millis() + 10_000).unwrap();

        let second = handler.get(&alice).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().score, 10);
    }

    #[test]
    fn test_save_all_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);
        let record = handler.get_or_create(&PlayerId::in_region("us", "kim")).unwrap();
        record.lock().score = 5;
        let file = dir.path().join("us").join("kim.dat");

        assert_eq!(handler.save_all().unwrap(), 1);
        assert_eq!(handler.resident_count(), 0);
        assert_eq!(handler.branch_count(), 0);
        let first = fs::read(&file).unwrap();

        assert_eq!(handler.save_all().unwrap(), 0);
        assert_eq!(handler.resident_count(), 0);
        assert_eq!(first, fs::read(&file).unwrap());
    }

    #[test]
    fn test_save_keeps_foreign_keys() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("lena.dat"),
            r#"{ "id": "lena", "score": 1, "legacy_flag": true }"#,
        )
        .unwrap();

        let mut handler = handler(&dir, 60);
        handler.get_or_create(&PlayerId::new("lena")).unwrap().lock().score = 2;
        handler.save_all().unwrap();

        let map: StructuredMap = storage::read_map(&dir.path().join("lena.dat")).unwrap().unwrap();
        assert_eq!(map["score"], serde_json::json!(2));
        assert_eq!(map["legacy_flag"], serde_json::json!(true));
    }

    #[test]
    fn test_copy_of_all_reads_disk_only() {
        let dir = TempDir::new().unwrap();
        let mut handler = handler(&dir, 60);

        handler.get_or_create(&PlayerId::new("a")).unwrap();
        let resident = handler.get_or_create(&PlayerId::in_region("eu", "b")).unwrap();
        resident.lock().score = 99;
        std::fs::write(dir.path().join("notes.txt"), "not a record").unwrap();
        handler.save_all().unwrap();
        handler.get_or_create(&PlayerId::in_region("eu", "b")).unwrap().lock().score = 100;

        let mut copies = handler.copy_of_all().unwrap();
        copies.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[1].score, 99);
        // Only "b" is resident; enumeration did not load anything.
        assert_eq!(handler.resident_count(), 1);
    }

    #[test]
    fn test_copy_of_all_missing_dir() {
        let dir = TempDir::new().unwrap();
        let handler = TypeHandler::new(Players, dir.path().join("none"), Duration::from_secs(1))
            .with_codec(player_codec());
        assert!(handler.copy_of_all().unwrap().is_empty());
    }

    #[test]
    fn test_path_conflict_is_reported() {
        struct Flat;
        impl RecordKind for Flat {
            type Record = Player;
            type Descriptor = CachePath;

            fn type_name(&self) -> &'static str {
                "Flat"
            }

            fn descriptor_path(&self, descriptor: &CachePath) -> CachePath {
                descriptor.clone()
            }

            fn record_path(&self, record: &Player) -> CachePath {
                CachePath::new([record.id.clone()])
            }
        }

        let dir = TempDir::new().unwrap();
        let codec = SerdeCodec::<Flat, _>::new(|d: &CachePath| Player {
            id: d.leaf().unwrap_or_default().to_string(),
            region: None,
            score: 0,
            last_access: 0,
        });
        let mut handler = TypeHandler::new(Flat, dir.path(), Duration::from_secs(60)).with_codec(codec);

        handler.get_or_create(&CachePath::new(["a", "b"])).unwrap();
        let err = handler.get_or_create(&CachePath::new(["a"])).unwrap_err();
        assert!(matches!(err, CacheError::PathConflict { ref type_name, .. } if type_name == "Flat"));
        assert!(!dir.path().join("a.dat").exists());

        let err = handler.get_or_create(&CachePath::new(["..", "x"])).unwrap_err();
        assert!(matches!(err, CacheError::InvalidPath { .. }));
    }

    #[test]
    fn test_missing_codec() {
        let dir = TempDir::new().unwrap();
        let mut handler = TypeHandler::new(Players, dir.path(), Duration::from_secs(1));
        assert!(!handler.has_codec());
        let err = handler.get_or_create(&PlayerId::new("x")).unwrap_err();
        assert!(matches!(err, CacheError::MissingCodec { .. }));
    }
}
