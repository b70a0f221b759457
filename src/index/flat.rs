//! Host-only reference engine.
//!
//! `FlatEngine` stands in for the GPU engine where no device is available:
//! development runs, tests and benchmarks. It keeps every structure in an
//! arena addressed by raw handles and behaves like a native engine where it
//! matters to the pipeline: handles are opaque, releasing one twice is an
//! error, and conversion leaves the source allocated.
//!
//! The persisted artifact is an exact (brute force) index, not a graph.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::dataset::VectorsDataset;
use crate::error::{BuilderError, Result};
use crate::index::config::{CpuSearchConfig, IndexBuildConfig};
use crate::index::engine::{
    EngineError, EngineResult, IndexEngine, NativeIndex, NativeKind, PersistDestination, RawHandle,
};
use crate::types::{EngineKind, SpaceType};

const ARTIFACT_MAGIC: &[u8; 8] = b"RIBFLAT\0";
pub const ARTIFACT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 8;

#[derive(Debug, Clone)]
struct Graph {
    metric: SpaceType,
    dimension: usize,
    vectors: Vec<f32>,
    ef_search: usize,
    ef_construction: usize,
}

#[derive(Debug)]
enum Structure {
    Gpu(Graph),
    Cpu(Graph),
    IdMap { ids: Vec<i64>, target: RawHandle },
}

impl Structure {
    fn kind(&self) -> NativeKind {
        match self {
            Structure::Gpu(_) => NativeKind::GpuIndex,
            Structure::Cpu(_) => NativeKind::CpuIndex,
            Structure::IdMap { .. } => NativeKind::IdMap,
        }
    }
}

/// Arena-backed [`IndexEngine`].
#[derive(Debug)]
pub struct FlatEngine {
    arena: DashMap<u64, Structure>,
    next: AtomicU64,
}

impl Default for FlatEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatEngine {
    pub fn new() -> Self {
        Self {
            arena: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Structures currently allocated.
    pub fn live_structures(&self) -> usize {
        self.arena.len()
    }

    fn alloc(&self, structure: Structure) -> RawHandle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.arena.insert(raw, structure);
        // The counter starts at 1.
        RawHandle::new(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    fn graph(&self, raw: RawHandle, kind: NativeKind) -> EngineResult<Graph> {
        let entry = self
            .arena
            .get(&raw.get())
            .ok_or_else(|| EngineError::new(format!("{raw} is not allocated")))?;
        match (entry.value(), kind) {
            (Structure::Gpu(graph), NativeKind::GpuIndex)
            | (Structure::Cpu(graph), NativeKind::CpuIndex) => Ok(graph.clone()),
            (other, _) => Err(EngineError::new(format!(
                "{raw} is a {}, expected a {kind}",
                other.kind()
            ))),
        }
    }

    fn id_map(&self, id_map: Option<RawHandle>, target: RawHandle) -> EngineResult<Vec<i64>> {
        let raw = id_map.ok_or_else(|| EngineError::new("index has no id map"))?;
        let entry = self
            .arena
            .get(&raw.get())
            .ok_or_else(|| EngineError::new(format!("id map {raw} is not allocated")))?;
        match entry.value() {
            Structure::IdMap { ids, target: t } if *t == target => Ok(ids.clone()),
            Structure::IdMap { target: t, .. } => Err(EngineError::new(format!(
                "id map {raw} wraps {t}, not {target}"
            ))),
            other => Err(EngineError::new(format!("{raw} is a {}, not an id map", other.kind()))),
        }
    }
}

impl IndexEngine for FlatEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Faiss
    }

    fn build_gpu_index(
        &self,
        dataset: &VectorsDataset,
        config: &IndexBuildConfig,
    ) -> EngineResult<NativeIndex> {
        let to_engine = |e: BuilderError| EngineError::new(e.to_string());

        let mut vectors = Vec::with_capacity(dataset.doc_count() * dataset.dimension());
        for row in 0..dataset.doc_count() {
            vectors.extend(dataset.row_f32(row).map_err(to_engine)?);
        }
        let ids: Vec<i64> = dataset.doc_ids().map_err(to_engine)?.collect();

        let index = self.alloc(Structure::Gpu(Graph {
            metric: config.metric,
            dimension: dataset.dimension(),
            vectors,
            ef_search: config.cpu.ef_search,
            ef_construction: config.cpu.ef_construction,
        }));
        let id_map = self.alloc(Structure::IdMap { ids, target: index });
        debug!(%index, %id_map, docs = dataset.doc_count(), "built flat index");
        Ok(NativeIndex::gpu(index, Some(id_map)))
    }

    fn convert_to_cpu(&self, gpu: &NativeIndex, config: &CpuSearchConfig) -> EngineResult<RawHandle> {
        let mut graph = self.graph(gpu.index, NativeKind::GpuIndex)?;
        let id_map = gpu
            .id_map
            .ok_or_else(|| EngineError::new("GPU index has no id map"))?;

        graph.ef_search = config.ef_search;
        graph.ef_construction = config.ef_construction;
        let cpu = self.alloc(Structure::Cpu(graph));

        let repointed = match self.arena.get_mut(&id_map.get()) {
            Some(mut entry) => match entry.value_mut() {
                Structure::IdMap { target, .. } => {
                    *target = cpu;
                    Ok(())
                }
                other => Err(format!("{id_map} is a {}, not an id map", other.kind())),
            },
            None => Err(format!("id map {id_map} is not allocated")),
        };
        match repointed {
            Ok(()) => Ok(cpu),
            Err(message) => Err(EngineError::with_partial(message, NativeIndex::cpu(cpu, None))),
        }
    }

    fn persist(&self, cpu: &NativeIndex, destination: PersistDestination<'_>) -> EngineResult<()> {
        let graph = self.graph(cpu.index, NativeKind::CpuIndex)?;
        let ids = self.id_map(cpu.id_map, cpu.index)?;

        let artifact = FlatArtifact {
            metric: graph.metric,
            dimension: graph.dimension,
            ef_search: graph.ef_search,
            ef_construction: graph.ef_construction,
            ids,
            vectors: graph.vectors,
        };
        let bytes = artifact
            .to_bytes()
            .map_err(|e| EngineError::new(e.to_string()))?;

        match destination {
            PersistDestination::File(path) => std::fs::write(path, &bytes)
                .map_err(|e| EngineError::new(format!("writing {}: {e}", path.display())))?,
            PersistDestination::Buffer(buf) => buf.extend_from_slice(&bytes),
        }
        Ok(())
    }

    fn release(&self, raw: RawHandle, kind: NativeKind) -> EngineResult<()> {
        match self.arena.remove_if(&raw.get(), |_, s| s.kind() == kind) {
            Some(_) => Ok(()),
            None => match self.arena.get(&raw.get()) {
                Some(entry) => Err(EngineError::new(format!(
                    "release of {raw} as {kind}, but it is a {}",
                    entry.kind()
                ))),
                None => Err(EngineError::new(format!("double release of {kind} {raw}"))),
            },
        }
    }
}

/// Decoded flat index artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatArtifact {
    pub metric: SpaceType,
    pub dimension: usize,
    pub ef_search: usize,
    pub ef_construction: usize,
    pub ids: Vec<i64>,
    /// Row-major, `ids.len() * dimension` values.
    pub vectors: Vec<f32>,
}

impl FlatArtifact {
    /// Magic, version, xxh3 of the body, then the bincode body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(ARTIFACT_MAGIC);
        out.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
        out.extend_from_slice(&xxh3_64(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN || &data[..8] != ARTIFACT_MAGIC {
            return Err(BuilderError::Persist("not a flat index artifact".to_string()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&data[8..12]);
        let version = u32::from_le_bytes(word);
        if version != ARTIFACT_VERSION {
            return Err(BuilderError::Persist(format!(
                "unsupported artifact version {version}"
            )));
        }
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&data[12..HEADER_LEN]);
        let expected = u64::from_le_bytes(checksum);
        let body = &data[HEADER_LEN..];
        let actual = xxh3_64(body);
        if expected != actual {
            return Err(BuilderError::Persist(format!(
                "artifact checksum mismatch: expected {expected:#x}, got {actual:#x}"
            )));
        }
        Ok(bincode::deserialize(body)?)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Exact top-`k` by the artifact's metric, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let mut scored: Vec<(i64, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .zip(&self.ids)
            .map(|(row, id)| (*id, distance(self.metric, query, row)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        scored
    }
}

/// Smaller is closer for every metric.
fn distance(metric: SpaceType, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SpaceType::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        SpaceType::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        SpaceType::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
    }
}
