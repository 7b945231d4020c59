//! Cache registry and background sweep.
//!
//! [`Cache`] maps each record kind to its [`TypeHandler`], guards every handler
//! with its own lock and owns the lifecycle (`Registering → Running → Stopped`).
//! While running, a tokio task periodically evicts idle records and, on
//! shutdown, flushes everything that is still resident.

use crate::config::RegistryConfig;
use crate::error::{CacheError, Result};
use crate::handler::TypeHandler;
use crate::record::{now_millis, RecordKind, Shared};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Registry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Handlers may be registered; record access is refused.
    Registering,
    Running,
    /// Terminal.
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Registering => "registering",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Type-erased view of a registered handler, used by the sweep and flush.
trait ManagedHandler: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn save_all(&self) -> Result<usize>;

    fn check_all(&self, now_millis: i64) -> Result<usize>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A handler behind its per-type lock.
struct HandlerSlot<K: RecordKind> {
    type_name: &'static str,
    handler: Mutex<TypeHandler<K>>,
}

impl<K: RecordKind> ManagedHandler for HandlerSlot<K> {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn save_all(&self) -> Result<usize> {
        self.handler.lock().save_all()
    }

    fn check_all(&self, now_millis: i64) -> Result<usize> {
        self.handler.lock().check_all(now_millis)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct RegistryState {
    lifecycle: Lifecycle,
    handlers: HashMap<TypeId, Arc<dyn ManagedHandler>>,
    /// Registration order; sweeps and flushes visit handlers in this order.
    order: Vec<TypeId>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct CacheInner {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

/// Shared handle to the cache registry.
///
/// Clones refer to the same registry. Record access is synchronous and may
/// block on disk I/O; async callers should wrap calls in
/// `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(RegistryState {
                    lifecycle: Lifecycle::Registering,
                    handlers: HashMap::new(),
                    order: Vec::new(),
                    shutdown: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Register the handler for record kind `K`.
    ///
    /// Only allowed before [`start`](Self::start). The handler must carry a
    /// codec, and each kind may be registered once.
    pub fn register_handler<K: RecordKind>(&self, handler: TypeHandler<K>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Registering {
            return Err(CacheError::RegistrationClosed);
        }
        let type_name = handler.type_name();
        if !handler.has_codec() {
            return Err(CacheError::MissingCodec {
                type_name: type_name.to_string(),
            });
        }

        let id = TypeId::of::<K>();
        if state.handlers.contains_key(&id) {
            return Err(CacheError::AlreadyRegistered {
                type_name: type_name.to_string(),
            });
        }

        debug!(
            "Registered {} handler at {}",
            type_name,
            handler.base_dir().display()
        );
        let slot = HandlerSlot {
            type_name,
            handler: Mutex::new(handler),
        };
        state.handlers.insert(id, Arc::new(slot));
        state.order.push(id);
        Ok(())
    }

    /// Start the cache and spawn the sweep task on the current tokio runtime.
    pub fn start(&self) -> Result<SweeperHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| CacheError::Config {
            message: format!("starting the cache requires a tokio runtime: {}", e),
        })?;
        let shutdown = self.transition_to_running()?;

        let cache = self.clone();
        let task = runtime.spawn(async move { cache.sweep_loop(shutdown).await });
        Ok(SweeperHandle { task })
    }

    /// Start the cache and drive the sweep loop on the calling task until
    /// [`stop`](Self::stop) is called.
    ///
    /// Returns once the final flush has completed.
    pub async fn run(&self) -> Result<()> {
        let shutdown = self.transition_to_running()?;
        self.sweep_loop(shutdown).await;
        Ok(())
    }

    /// Stop the cache and signal the sweep loop to flush and exit.
    ///
    /// Record access fails from here on. Use [`SweeperHandle::join`] to wait
    /// for the final flush.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Running {
            return Err(CacheError::NotRunning {
                state: state.lifecycle,
            });
        }
        state.lifecycle = Lifecycle::Stopped;
        if let Some(shutdown) = state.shutdown.take() {
            // The loop may already be gone; the flush then happened anyway.
            let _ = shutdown.send(());
        }
        info!("Cache stopping");
        Ok(())
    }

    /// Stop the cache and wait for the final flush.
    pub async fn shutdown(&self, handle: SweeperHandle) -> Result<()> {
        self.stop()?;
        handle.join().await
    }

    fn transition_to_running(&self) -> Result<oneshot::Receiver<()>> {
        if self.inner.config.sweep_interval.is_zero() {
            return Err(CacheError::Config {
                message: "sweep interval must be greater than zero".into(),
            });
        }

        let mut state = self.inner.state.lock();
        match state.lifecycle {
            Lifecycle::Registering => {}
            Lifecycle::Running => return Err(CacheError::AlreadyStarted),
            Lifecycle::Stopped => {
                return Err(CacheError::NotRunning {
                    state: Lifecycle::Stopped,
                })
            }
        }

        let (tx, rx) = oneshot::channel();
        state.shutdown = Some(tx);
        state.lifecycle = Lifecycle::Running;
        info!(
            "Cache started with {} handler(s), sweeping every {:?}",
            state.order.len(),
            self.inner.config.sweep_interval
        );
        Ok(rx)
    }

    async fn sweep_loop(&self, mut shutdown: oneshot::Receiver<()>) {
        let mut guard = FlushOnDrop {
            cache: self.clone(),
            armed: true,
        };
        let period = self.inner.config.sweep_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cache = self.clone();
                    // Failures are logged per handler inside the sweep.
                    if let Err(e) = tokio::task::spawn_blocking(move || cache.sweep()).await {
                        error!("Sweep task failed: {}", e);
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        let cache = self.clone();
        match tokio::task::spawn_blocking(move || cache.save_all()).await {
            Ok(Ok(())) => info!("Cache stopped"),
            Ok(Err(e)) => error!("Final flush incomplete: {}", e),
            Err(e) => error!("Final flush task failed: {}", e),
        }
        guard.armed = false;
    }

    /// Move to `Stopped` without going through [`stop`](Self::stop).
    fn mark_stopped(&self) {
        let mut state = self.inner.state.lock();
        state.lifecycle = Lifecycle::Stopped;
        state.shutdown = None;
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedHandler>> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.handlers.get(id).cloned())
            .collect()
    }

    /// Evict idle records of every registered type.
    ///
    /// Handlers are visited one at a time. A failing handler is logged and
    /// does not stop the others; the first failure is returned at the end.
    pub fn sweep(&self) -> Result<usize> {
        let now = now_millis();
        let mut evicted = 0;
        let mut first_err = None;

        for handler in self.snapshot() {
            match handler.check_all(now) {
                Ok(count) => evicted += count,
                Err(e) => {
                    error!("Sweep of {} failed: {}", handler.type_name(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    /// Persist and evict every resident record of every registered type.
    ///
    /// Allowed in any state since it doubles as the shutdown flush.
    pub fn save_all(&self) -> Result<()> {
        let mut first_err = None;

        for handler in self.snapshot() {
            match handler.save_all() {
                Ok(count) => info!("Flushed {} {} record(s)", count, handler.type_name()),
                Err(e) => {
                    error!("Flush of {} failed: {}", handler.type_name(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn slot<K: RecordKind>(&self) -> Result<Arc<HandlerSlot<K>>> {
        let handler = {
            let state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Running {
                return Err(CacheError::NotRunning {
                    state: state.lifecycle,
                });
            }
            state.handlers.get(&TypeId::of::<K>()).cloned()
        };

        handler
            .and_then(|handler| handler.as_any().downcast::<HandlerSlot<K>>().ok())
            .ok_or_else(|| CacheError::NotRegistered {
                type_name: std::any::type_name::<K>().to_string(),
            })
    }

    fn with_handler<K, T, F>(&self, f: F) -> Result<T>
    where
        K: RecordKind,
        F: FnOnce(&mut TypeHandler<K>) -> Result<T>,
    {
        let slot = self.slot::<K>()?;
        let mut handler = slot.handler.lock();
        // A stop may have landed while we waited; the final flush would miss
        // anything created now.
        let state = self.lifecycle();
        if state != Lifecycle::Running {
            return Err(CacheError::NotRunning { state });
        }
        f(&mut *handler)
    }

    /// See [`TypeHandler::get`].
    pub fn get<K: RecordKind>(&self, descriptor: &K::Descriptor) -> Result<Option<Shared<K::Record>>> {
        self.with_handler::<K, _, _>(|h| h.get(descriptor))
    }

    /// See [`TypeHandler::get_or_create`].
    pub fn get_or_create<K: RecordKind>(&self, descriptor: &K::Descriptor) -> Result<Shared<K::Record>> {
        self.with_handler::<K, _, _>(|h| h.get_or_create(descriptor))
    }

    pub fn exists<K: RecordKind>(&self, descriptor: &K::Descriptor) -> Result<bool> {
        self.with_handler::<K, _, _>(|h| h.exists(descriptor))
    }

    pub fn set<K: RecordKind>(&self, record: K::Record) -> Result<Shared<K::Record>> {
        self.with_handler::<K, _, _>(|h| h.set(record))
    }

    pub fn delete<K: RecordKind>(&self, descriptor: &K::Descriptor) -> Result<bool> {
        self.with_handler::<K, _, _>(|h| h.delete(descriptor))
    }

    /// Remove `record` at its own path.
    ///
    /// The caller must not hold the record's lock.
    pub fn delete_record<K: RecordKind>(&self, record: &Shared<K::Record>) -> Result<()> {
        self.with_handler::<K, _, _>(|h| h.delete_record(record))
    }

    pub fn copy_of_all<K: RecordKind>(&self) -> Result<Vec<K::Record>> {
        self.with_handler::<K, _, _>(|h| h.copy_of_all())
    }

    pub fn resident_count<K: RecordKind>(&self) -> Result<usize> {
        self.with_handler::<K, _, _>(|h| Ok(h.resident_count()))
    }

    pub fn branch_count<K: RecordKind>(&self) -> Result<usize> {
        self.with_handler::<K, _, _>(|h| Ok(h.branch_count()))
    }
}

/// Flushes synchronously if the sweep loop is dropped before its own flush.
struct FlushOnDrop {
    cache: Cache,
    armed: bool,
}

impl Drop for FlushOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Sweep loop cancelled, flushing resident records");
        self.cache.mark_stopped();
        if let Err(e) = self.cache.save_all() {
            error!("Flush after cancellation incomplete: {}", e);
        }
    }
}

/// Handle to the spawned sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Wait for the sweep task to finish its final flush.
    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(|e| CacheError::Task {
            message: e.to_string(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
