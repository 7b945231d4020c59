//! Pathcache - hierarchical, disk-backed record cache.
//!
//! Records are addressed by a path of string segments. Each record type is
//! served by a [`TypeHandler`] that keeps recently used records in memory and
//! persists them as JSON files under its own base directory, mirroring the
//! path. The [`Cache`] registry ties handlers together, serializes access per
//! record type and runs a background sweep that saves and evicts idle records.
//!
//! # Example
//!
//! ```rust,ignore
//! use pathcache::{Cache, TypeHandler, SerdeCodec};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> pathcache::Result<()> {
//!     let cache = Cache::new();
//!     cache.register_handler(
//!         TypeHandler::new(Players, "./data/players", Duration::from_secs(300))
//!             .with_codec(SerdeCodec::new(Player::new)),
//!     )?;
//!     let sweeper = cache.start()?;
//!
//!     let alice = cache.get_or_create::<Players>(&PlayerId::new("alice"))?;
//!     alice.lock().score += 10;
//!
//!     // Saves everything still resident.
//!     cache.shutdown(sweeper).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod path;
pub mod record;
pub mod registry;
pub mod storage;
pub mod tree;

// Re-export commonly used types
pub use config::{HandlerConfig, RegistryConfig};
pub use error::{CacheError, Result};
pub use handler::TypeHandler;
pub use path::CachePath;
pub use record::{now_millis, Cacheable, RecordCodec, RecordKind, SerdeCodec, Shared, StructuredMap};
pub use registry::{Cache, Lifecycle, SweeperHandle};
pub use tree::PathTree;
