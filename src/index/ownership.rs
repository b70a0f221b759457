//! Ownership tracking for native index structures.
//!
//! Every structure an engine hands out is registered here and addressed by a
//! [`HandleId`]. A handle is in exactly one state at a time:
//!
//! * `Live`: the manager owns the structure and will free it on release.
//! * `Converting`: the structure was detached for a GPU to CPU transfer that
//!   has not finished yet. Only the manager can still free it.
//! * `Transferred`: the structure was consumed by a transfer. Its id map now
//!   belongs to the derived handle and its graph has been freed.
//! * `Released`: the structure has been freed.
//!
//! Releasing a handle that is not `Live` is a no-op, so release is idempotent
//! and a transferred source can never be freed twice. Failures to free are
//! logged and counted; they never propagate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{BuilderError, Result};
use crate::index::engine::{EngineResult, IndexEngine, NativeIndex, RawHandle, Residency};

/// Identifier of a tracked handle. Cheap to copy; holding one grants nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Token for a live registered index.
///
/// Not `Clone`: [`OwnershipManager::transfer`] consumes it, so the source of a
/// transfer cannot be used for another one.
#[derive(Debug, PartialEq, Eq)]
pub struct TrackedIndex {
    id: HandleId,
    residency: Residency,
}

impl TrackedIndex {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Live,
    Converting,
    Transferred { into: HandleId },
    Released,
}

#[derive(Debug)]
enum Slot {
    Live(NativeIndex),
    Converting(NativeIndex),
    Transferred(HandleId),
    Released,
}

impl Slot {
    fn state(&self) -> HandleState {
        match self {
            Slot::Live(_) => HandleState::Live,
            Slot::Converting(_) => HandleState::Converting,
            Slot::Transferred(into) => HandleState::Transferred { into: *into },
            Slot::Released => HandleState::Released,
        }
    }
}

/// Register/release counters for one manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnershipStats {
    pub registered: u64,
    /// Handles whose lifetime ended, either by release or by being a transfer source.
    pub released: u64,
    pub transferred: u64,
    /// Native frees the engine reported as failed.
    pub release_failures: u64,
}

impl OwnershipStats {
    pub fn outstanding(&self) -> u64 {
        self.registered - self.released
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    slots: HashMap<HandleId, Slot>,
    stats: OwnershipStats,
}

/// Tracks and frees the native structures of one pipeline run.
pub struct OwnershipManager {
    engine: Arc<dyn IndexEngine>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for OwnershipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipManager")
            .field("stats", &self.stats())
            .finish()
    }
}

impl OwnershipManager {
    pub fn new(engine: Arc<dyn IndexEngine>) -> Self {
        Self {
            engine,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take ownership of a native index.
    pub fn register(&self, native: NativeIndex) -> TrackedIndex {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = HandleId(registry.next_id);
        registry.slots.insert(id, Slot::Live(native));
        registry.stats.registered += 1;
        crate::metrics::NATIVE_HANDLES_TOTAL
            .with_label_values(&["registered"])
            .inc();
        debug!(handle = %id, residency = ?native.residency, index = %native.index, "registered native index");
        TrackedIndex {
            id,
            residency: native.residency,
        }
    }

    /// Run `f` against the native index behind a live handle.
    pub fn with_native<T>(&self, id: HandleId, f: impl FnOnce(&NativeIndex) -> T) -> Result<T> {
        let native = match self.registry().slots.get(&id) {
            Some(Slot::Live(native)) => *native,
            Some(other) => {
                return Err(BuilderError::Ownership(format!(
                    "{id} is not live (state: {:?})",
                    other.state()
                )))
            }
            None => return Err(BuilderError::Ownership(format!("{id} is not registered"))),
        };
        Ok(f(&native))
    }

    /// Free the structures behind `id`. Releasing a handle that is already
    /// released, transferred or unknown does nothing.
    pub fn release(&self, id: HandleId) {
        let native = {
            let mut guard = self.registry();
            let registry = &mut *guard;
            let native = match registry.slots.get_mut(&id) {
                Some(slot) => match *slot {
                    Slot::Live(native) => {
                        *slot = Slot::Released;
                        native
                    }
                    _ => {
                        debug!(handle = %id, "release of non-live handle ignored");
                        return;
                    }
                },
                None => {
                    debug!(handle = %id, "release of unregistered handle ignored");
                    return;
                }
            };
            registry.stats.released += 1;
            native
        };
        crate::metrics::NATIVE_HANDLES_TOTAL
            .with_label_values(&["released"])
            .inc();
        self.free(id, &native);
    }

    /// Move the structures of `source` into a new CPU-resident handle.
    ///
    /// `convert` receives the GPU index and returns the raw handle of the host
    /// copy. On success the id map moves to the derived handle and the GPU
    /// graph is freed. On failure everything the source held, plus any
    /// partial output of `convert`, is freed. Either way `source` ends up
    /// invalid and a later `release(source.id())` is a no-op.
    pub fn transfer<F>(&self, source: TrackedIndex, convert: F) -> Result<TrackedIndex>
    where
        F: FnOnce(&NativeIndex) -> EngineResult<RawHandle>,
    {
        let gpu = {
            let mut registry = self.registry();
            match registry.slots.get_mut(&source.id) {
                Some(slot) => match *slot {
                    Slot::Live(native) => {
                        *slot = Slot::Converting(native);
                        native
                    }
                    ref other => {
                        return Err(BuilderError::Ownership(format!(
                            "cannot transfer {}: not live (state: {:?})",
                            source.id,
                            other.state()
                        )))
                    }
                },
                None => {
                    return Err(BuilderError::Ownership(format!(
                        "cannot transfer {}: not registered",
                        source.id
                    )))
                }
            }
        };

        match convert(&gpu) {
            Ok(cpu_raw) => {
                let derived = self.register(NativeIndex::cpu(cpu_raw, gpu.id_map));
                self.settle_transfer(source.id, Some(derived.id));
                // The id map now wraps the host index; only the device graph is left to free.
                self.free(
                    source.id,
                    &NativeIndex {
                        id_map: None,
                        ..gpu
                    },
                );
                debug!(source = %source.id, derived = %derived.id, "transferred native index to host");
                Ok(derived)
            }
            Err(e) => {
                self.settle_transfer(source.id, None);
                self.free(source.id, &gpu);
                if let Some(partial) = e.partial {
                    let orphan = self.register(partial);
                    self.release(orphan.id);
                }
                Err(BuilderError::Conversion(e.message))
            }
        }
    }

    fn settle_transfer(&self, source: HandleId, derived: Option<HandleId>) {
        let mut registry = self.registry();
        let slot = match derived {
            Some(into) => Slot::Transferred(into),
            None => Slot::Released,
        };
        registry.slots.insert(source, slot);
        registry.stats.released += 1;
        if derived.is_some() {
            registry.stats.transferred += 1;
        }
        drop(registry);
        let event = if derived.is_some() { "transferred" } else { "released" };
        crate::metrics::NATIVE_HANDLES_TOTAL
            .with_label_values(&[event])
            .inc();
    }

    /// Free every structure still owned by the manager. Returns how many
    /// handles were released.
    pub fn release_all(&self) -> usize {
        let pending: Vec<(HandleId, NativeIndex)> = {
            let mut registry = self.registry();
            let mut pending = Vec::new();
            for (id, slot) in registry.slots.iter_mut() {
                match *slot {
                    Slot::Live(native) | Slot::Converting(native) => {
                        pending.push((*id, native));
                        *slot = Slot::Released;
                    }
                    Slot::Transferred(_) | Slot::Released => {}
                }
            }
            registry.stats.released += pending.len() as u64;
            pending
        };

        for (id, native) in &pending {
            warn!(handle = %id, "releasing native index left live at teardown");
            crate::metrics::NATIVE_HANDLES_TOTAL
                .with_label_values(&["released"])
                .inc();
            self.free(*id, native);
        }
        pending.len()
    }

    fn free(&self, id: HandleId, native: &NativeIndex) {
        for (raw, kind) in native.components() {
            if let Err(e) = self.engine.release(raw, kind) {
                warn!(
                    handle = %id,
                    raw = %raw,
                    kind = %kind,
                    error = %e,
                    "failed to release native structure"
                );
                crate::metrics::CLEANUP_WARNINGS_TOTAL.inc();
                self.registry().stats.release_failures += 1;
            }
        }
    }

    pub fn state(&self, id: HandleId) -> Option<HandleState> {
        self.registry().slots.get(&id).map(Slot::state)
    }

    pub fn stats(&self) -> OwnershipStats {
        self.registry().stats
    }

    /// Number of handles the manager would still have to free.
    pub fn live_count(&self) -> usize {
        self.registry()
            .slots
            .values()
            .filter(|s| matches!(s, Slot::Live(_) | Slot::Converting(_)))
            .count()
    }
}

impl Drop for OwnershipManager {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            warn!(released, "ownership manager dropped with live native indexes");
        }
    }
}
