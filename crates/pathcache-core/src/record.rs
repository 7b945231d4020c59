//! Record, descriptor and codec traits.
//!
//! A [`RecordKind`] tells the engine how one record type is addressed; a
//! [`RecordCodec`] tells it how to build, serialize and deserialize that
//! record. Both are supplied when the handler is registered.

use crate::config::StorageConfig;
use crate::error::{CacheError, Result};
use crate::path::CachePath;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

/// Ordered string-keyed map of primitive (or nested) values.
pub type StructuredMap = serde_json::Map<String, serde_json::Value>;

/// Live handle to a resident record. Clones share the same instance.
pub type Shared<T> = Arc<Mutex<T>>;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A record that tracks when it was last fetched from the cache.
pub trait Cacheable: Send + 'static {
    /// Last access time in milliseconds since the Unix epoch.
    fn last_access(&self) -> i64;

    /// Record an access at `now_millis`.
    fn touch(&mut self, now_millis: i64);
}

/// Addressing rules for one record type.
pub trait RecordKind: Send + 'static {
    type Record: Cacheable;
    type Descriptor;

    /// Name used in logs and error messages.
    fn type_name(&self) -> &'static str;

    fn descriptor_path(&self, descriptor: &Self::Descriptor) -> CachePath;

    fn record_path(&self, record: &Self::Record) -> CachePath;

    /// Whether `file` is one of this type's record files.
    ///
    /// Used by bulk enumeration to skip unrelated files sharing the
    /// directory tree.
    fn is_valid(&self, file: &Path) -> bool {
        file.extension()
            .is_some_and(|ext| ext == StorageConfig::RECORD_EXTENSION)
    }

    /// Called after a record was removed and its file deleted.
    fn on_delete(&self, _removed: Option<&Shared<Self::Record>>, _path: &CachePath) {}
}

/// Construction and (de)serialization of one record type.
pub trait RecordCodec<K: RecordKind>: Send {
    /// Default state of a record that was never persisted.
    fn new_default(&self, descriptor: &K::Descriptor) -> K::Record;

    fn serialize(&self, record: &K::Record) -> Result<StructuredMap>;

    fn deserialize(&self, map: StructuredMap) -> Result<K::Record>;
}

/// Codec for records implementing serde's traits.
///
/// `factory` builds the default record from a descriptor.
pub struct SerdeCodec<K, F> {
    factory: F,
    _kind: PhantomData<fn() -> K>,
}

impl<K, F> SerdeCodec<K, F>
where
    K: RecordKind,
    F: Fn(&K::Descriptor) -> K::Record + Send,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            _kind: PhantomData,
        }
    }
}

impl<K, F> RecordCodec<K> for SerdeCodec<K, F>
where
    K: RecordKind,
    K::Record: Serialize + DeserializeOwned,
    F: Fn(&K::Descriptor) -> K::Record + Send,
{
    fn new_default(&self, descriptor: &K::Descriptor) -> K::Record {
        (self.factory)(descriptor)
    }

    fn serialize(&self, record: &K::Record) -> Result<StructuredMap> {
        match serde_json::to_value(record)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(CacheError::Codec {
                message: format!("record serialized to a non-map value: {}", other),
            }),
        }
    }

    fn deserialize(&self, map: StructuredMap) -> Result<K::Record> {
        serde_json::from_value(serde_json::Value::Object(map)).map_err(|e| CacheError::Codec {
            message: e.to_string(),
        })
    }
}
