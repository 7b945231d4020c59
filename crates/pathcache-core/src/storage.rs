//! Structured text files backing each cached record.
//!
//! Writes are atomic:
//! 1. Write to a temp file with a unique PID+TID suffix
//! 2. Flush and `sync_all` so the data reaches disk
//! 3. Rename over the target path

use crate::config::StorageConfig;
use crate::error::{CacheError, Result};
use crate::record::StructuredMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process;
use std::thread;
use tracing::debug;

/// Read a record file as a structured map.
///
/// Returns `None` if the file doesn't exist. A document that does not parse,
/// or whose top level is not a map, is a JSON error.
pub fn read_map(path: &Path) -> Result<Option<StructuredMap>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CacheError::Io {
                message: format!("Failed to read {}", path.display()),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })
        }
    };

    match serde_json::from_str(&contents).map_err(|e| CacheError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })? {
        serde_json::Value::Object(map) => Ok(Some(map)),
        _ => Err(CacheError::Json {
            message: format!("{} does not hold a key-value document", path.display()),
            source: None,
        }),
    }
}

/// Write a structured map to `path` atomically.
///
/// Missing parent directories are created.
pub fn write_map(path: &Path, map: &StructuredMap) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| CacheError::Io {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let temp_path = path.with_extension(format!(
        "{}.{}.{}.{}",
        StorageConfig::RECORD_EXTENSION,
        process::id(),
        thread_id(),
        StorageConfig::TEMP_SUFFIX
    ));

    let mut serialized = serde_json::to_string_pretty(map)?;
    serialized.push('\n');

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| CacheError::Io {
                message: format!("Failed to create temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;

        file.write_all(serialized.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_all())
            .map_err(|e| CacheError::Io {
                message: format!("Failed to write temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(CacheError::Io {
            message: format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            ),
            path: Some(path.to_path_buf()),
            source: Some(e),
        });
    }

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Save `map` over the existing document at `path`.
///
/// Keys already in the file that `map` does not mention are kept.
pub fn merge_and_write(path: &Path, map: StructuredMap) -> Result<()> {
    let merged = match read_map(path)? {
        Some(mut existing) => {
            existing.extend(map);
            existing
        }
        None => map,
    };
    write_map(path, &merged)
}

/// Delete a record file. Returns whether a file was removed.
pub fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io_with_path(e, path)),
    }
}

/// Get a unique thread identifier.
fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}
