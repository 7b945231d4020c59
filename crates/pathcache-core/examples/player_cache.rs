//! Player cache example - create, mutate, evict and reload one record.
//!
//! Run with `RUST_LOG=debug` to see loads, writes and evictions.

use pathcache::{Cache, CachePath, Cacheable, HandlerConfig, RecordKind, Result, SerdeCodec, TypeHandler};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Serialize, Deserialize)]
struct Player {
    id: String,
    score: i64,
    #[serde(skip)]
    last_access: i64,
}

impl Cacheable for Player {
    fn last_access(&self) -> i64 {
        self.last_access
    }

    fn touch(&mut self, now_millis: i64) {
        self.last_access = now_millis;
    }
}

struct Players;

impl RecordKind for Players {
    type Record = Player;
    type Descriptor = String;

    fn type_name(&self) -> &'static str {
        "Player"
    }

    fn descriptor_path(&self, id: &String) -> CachePath {
        CachePath::new([id.as_str()])
    }

    fn record_path(&self, record: &Player) -> CachePath {
        CachePath::new([record.id.as_str()])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let base_dir = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    let config = HandlerConfig::new(&base_dir, 2);

    let cache = Cache::new();
    let codec = SerdeCodec::<Players, _>::new(|id: &String| Player {
        id: id.clone(),
        score: 0,
        last_access: 0,
    });
    cache.register_handler(TypeHandler::from_config(Players, &config).with_codec(codec))?;
    let sweeper = cache.start()?;

    let alice = "alice".to_string();
    let record = cache.get_or_create::<Players>(&alice)?;
    record.lock().score = 10;
    info!("alice created with score {}", record.lock().score);

    info!("Waiting for the sweep to evict alice...");
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!("Resident players: {}", cache.resident_count::<Players>()?);

    if let Some(reloaded) = cache.get::<Players>(&alice)? {
        info!("alice reloaded with score {}", reloaded.lock().score);
    }

    cache.shutdown(sweeper).await
}
