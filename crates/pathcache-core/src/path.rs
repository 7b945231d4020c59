//! Cache paths and their mapping onto the storage directory tree.
//!
//! A path `[a, b, c]` indexes the in-memory tree as `a → b → c` and lives on
//! disk at `<base>/a/b/c.dat`.

use crate::config::StorageConfig;
use crate::error::{CacheError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Ordered sequence of segment keys; the last one is the leaf key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CachePath {
    segments: Vec<String>,
}

impl CachePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The terminal segment, if any.
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Everything but the leaf.
    pub fn parents(&self) -> &[String] {
        match self.segments.split_last() {
            Some((_, parents)) => parents,
            None => &[],
        }
    }

    pub(crate) fn push(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    pub(crate) fn pop(&mut self) -> Option<String> {
        self.segments.pop()
    }

    /// Reject paths that would escape or confuse the storage layout.
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(self.invalid("path has no segments"));
        }
        for segment in &self.segments {
            if segment.is_empty() {
                return Err(self.invalid("empty segment"));
            }
            if segment == "." || segment == ".." {
                return Err(self.invalid("relative segment"));
            }
            if segment.contains(|c| matches!(c, '/' | '\\' | '\0')) {
                return Err(self.invalid("segment contains a path separator"));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> CacheError {
        CacheError::InvalidPath {
            path: self.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Directory holding the record file: `<base>/<seg_0>/…/<seg_n-2>`.
    pub fn directory(&self, base: &Path) -> PathBuf {
        let mut dir = base.to_path_buf();
        for segment in self.parents() {
            dir.push(segment);
        }
        dir
    }

    /// Record file location: `<base>/<seg_0>/…/<seg_n-1>.dat`.
    pub fn file(&self, base: &Path) -> Result<PathBuf> {
        self.validate()?;
        let leaf = self.leaf().unwrap_or_default();
        Ok(self
            .directory(base)
            .join(format!("{}.{}", leaf, StorageConfig::RECORD_EXTENSION)))
    }
}

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.segments.join(", "))
    }
}

impl<S: Into<String>> FromIterator<S> for CachePath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        CachePath::new(iter)
    }
}

impl From<Vec<String>> for CachePath {
    fn from(segments: Vec<String>) -> Self {
        Self { segments }
    }
}
