use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use remote_index_builder::dataset::VectorsDataset;
use remote_index_builder::index::config::{CpuSearchConfig, IndexBuildConfig};
use remote_index_builder::index::engine::{
    EngineError, EngineResult, IndexEngine, NativeIndex, NativeKind, PersistDestination, RawHandle,
};
use remote_index_builder::index::FlatEngine;
use remote_index_builder::types::EngineKind;

/// Where [`InstrumentedEngine`] injects a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Build,
    /// Build fails after allocating the device graph.
    BuildWithPartial,
    Convert,
    /// Conversion fails after allocating the host index.
    ConvertWithPartial,
    Persist,
    /// Every release reports an error (the structure is still freed).
    Release,
}

/// Whether the dataset still referenced its staged vectors when the engine
/// was asked to convert and to persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingSeen {
    pub during_convert: Option<bool>,
    pub during_persist: Option<bool>,
}

/// A [`FlatEngine`] that counts calls, records every release and can fail on demand.
pub struct InstrumentedEngine {
    inner: FlatEngine,
    fail_at: Option<FailPoint>,
    build_delay: Option<Duration>,
    pub build_calls: AtomicUsize,
    pub convert_calls: AtomicUsize,
    pub persist_calls: AtomicUsize,
    releases: Mutex<HashMap<u64, usize>>,
    pub last_config: Mutex<Option<IndexBuildConfig>>,
    staged: Mutex<Option<Bytes>>,
    pub staging_seen: Mutex<StagingSeen>,
}

impl InstrumentedEngine {
    pub fn new() -> Self {
        Self {
            inner: FlatEngine::new(),
            fail_at: None,
            build_delay: None,
            build_calls: AtomicUsize::new(0),
            convert_calls: AtomicUsize::new(0),
            persist_calls: AtomicUsize::new(0),
            releases: Mutex::new(HashMap::new()),
            last_config: Mutex::new(None),
            staged: Mutex::new(None),
            staging_seen: Mutex::new(StagingSeen::default()),
        }
    }

    pub fn failing_at(point: FailPoint) -> Self {
        Self {
            fail_at: Some(point),
            ..Self::new()
        }
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    /// Structures the underlying engine still holds.
    pub fn live_structures(&self) -> usize {
        self.inner.live_structures()
    }

    /// Raw handles released more than once.
    pub fn double_releases(&self) -> Vec<u64> {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(raw, _)| *raw)
            .collect()
    }

    pub fn release_count(&self) -> usize {
        self.releases.lock().unwrap().values().sum()
    }

    /// `Some(true)` while something other than this engine holds the staged vectors.
    fn staged_elsewhere(&self) -> Option<bool> {
        self.staged.lock().unwrap().as_ref().map(|b| !b.is_unique())
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.fail_at == Some(point)
    }
}

impl IndexEngine for InstrumentedEngine {
    fn kind(&self) -> EngineKind {
        self.inner.kind()
    }

    fn build_gpu_index(
        &self,
        dataset: &VectorsDataset,
        config: &IndexBuildConfig,
    ) -> EngineResult<NativeIndex> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_config.lock().unwrap() = Some(config.clone());
        *self.staged.lock().unwrap() = dataset.shared_vectors().ok();
        if let Some(delay) = self.build_delay {
            std::thread::sleep(delay);
        }
        if self.fails(FailPoint::Build) {
            return Err(EngineError::new("injected build failure"));
        }
        let built = self.inner.build_gpu_index(dataset, config)?;
        if self.fails(FailPoint::BuildWithPartial) {
            return Err(EngineError::with_partial("injected build failure", built));
        }
        Ok(built)
    }

    fn convert_to_cpu(&self, gpu: &NativeIndex, config: &CpuSearchConfig) -> EngineResult<RawHandle> {
        self.convert_calls.fetch_add(1, Ordering::SeqCst);
        self.staging_seen.lock().unwrap().during_convert = self.staged_elsewhere();
        if self.fails(FailPoint::Convert) {
            return Err(EngineError::new("injected conversion failure"));
        }
        let cpu = self.inner.convert_to_cpu(gpu, config)?;
        if self.fails(FailPoint::ConvertWithPartial) {
            return Err(EngineError::with_partial(
                "injected conversion failure",
                NativeIndex::cpu(cpu, None),
            ));
        }
        Ok(cpu)
    }

    fn persist(&self, cpu: &NativeIndex, destination: PersistDestination<'_>) -> EngineResult<()> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.staging_seen.lock().unwrap().during_persist = self.staged_elsewhere();
        self.staged.lock().unwrap().take();
        if self.fails(FailPoint::Persist) {
            return Err(EngineError::new("injected persist failure"));
        }
        self.inner.persist(cpu, destination)
    }

    fn release(&self, raw: RawHandle, kind: NativeKind) -> EngineResult<()> {
        *self.releases.lock().unwrap().entry(raw.get()).or_insert(0) += 1;
        let released = self.inner.release(raw, kind);
        if self.fails(FailPoint::Release) {
            return Err(EngineError::new("injected release failure"));
        }
        released
    }
}
