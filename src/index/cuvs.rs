//! CAGRA engine over the RAPIDS cuVS bindings.
//!
//! The device graph is built with `cagra::Index::build`. Conversion
//! serializes it to the hnswlib layout and loads the result into host
//! memory, which becomes the CPU index. The persisted artifact is the
//! hnswlib graph preceded by the id map.
//!
//! Cosine similarity is built as inner product over unit-length rows. Knobs
//! the bindings cannot forward are refused instead of dropped: a device other
//! than 0, `store_dataset = false`, `base_level_only = false` and IVF-PQ
//! parameters that differ from the ones derived for the dataset shape.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::{Mutex, MutexGuard};

use cuvs::cagra::{BuildAlgo, Index, IndexParams};
use cuvs::distance_type::DistanceType;
use cuvs::Resources;
use tracing::debug;

use crate::dataset::VectorsDataset;
use crate::index::assembler::{assemble, ConfigOverrides, DerivedParams};
use crate::index::config::{CpuSearchConfig, GraphBuildAlgo, IndexBuildConfig};
use crate::index::engine::{
    EngineError, EngineResult, IndexEngine, NativeIndex, NativeKind, PersistDestination, RawHandle,
};
use crate::types::{EngineKind, SpaceType};

const ARTIFACT_MAGIC: &[u8; 8] = b"RIBHNSW\0";

enum Structure {
    Gpu(DeviceIndex),
    Cpu(Vec<u8>),
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

struct DeviceIndex(Index);

// SAFETY: a device index is only touched while the engine's arena lock is
// held, so it is never used from two threads at once.
unsafe impl Send for DeviceIndex {}

struct Arena {
    next: u64,
    structures: HashMap<u64, Structure>,
}

impl Arena {
    fn alloc(&mut self, structure: Structure) -> RawHandle {
        self.next += 1;
        self.structures.insert(self.next, structure);
        RawHandle::new(NonZeroU64::new(self.next).unwrap_or(NonZeroU64::MIN))
    }
}

/// [`IndexEngine`] backed by cuVS CAGRA.
pub struct CuvsEngine {
    resources: Mutex<Resources>,
    arena: Mutex<Arena>,
}

// SAFETY: `Resources` is only used while its mutex is held.
unsafe impl Send for CuvsEngine {}
unsafe impl Sync for CuvsEngine {}

fn engine_err(context: &str) -> impl Fn(cuvs::Error) -> EngineError + '_ {
    move |e| EngineError::new(format!("{context}: {e}"))
}

impl CuvsEngine {
    pub fn new() -> EngineResult<Self> {
        let resources = Resources::new().map_err(engine_err("creating cuvs resources"))?;
        Ok(Self {
            resources: Mutex::new(resources),
            arena: Mutex::new(Arena {
                next: 0,
                structures: HashMap::new(),
            }),
        })
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn index_params(config: &IndexBuildConfig) -> EngineResult<IndexParams> {
        let algo = match config.gpu.graph_build_algo {
            GraphBuildAlgo::IvfPq => BuildAlgo::IVF_PQ,
            GraphBuildAlgo::NnDescent => BuildAlgo::NN_DESCENT,
        };
        let params = IndexParams::new()
            .map_err(engine_err("creating index params"))?
            .set_intermediate_graph_degree(config.gpu.intermediate_graph_degree)
            .set_graph_degree(config.gpu.graph_degree)
            .set_build_algo(algo);
        // SAFETY: `params.0` points at the struct allocated by
        // `cuvsCagraIndexParamsCreate` and owned by `params`.
        unsafe {
            (*params.0).metric = distance_type(config.metric);
        }
        Ok(params)
    }
}

fn distance_type(metric: SpaceType) -> DistanceType {
    match metric {
        SpaceType::L2 => DistanceType::L2Expanded,
        // Cosine rows are normalized before the build.
        SpaceType::InnerProduct | SpaceType::Cosine => DistanceType::InnerProduct,
    }
}

/// Refuse settings the cuVS bindings have no way to apply.
fn check_supported(config: &IndexBuildConfig, rows: usize, dim: usize) -> EngineResult<()> {
    let gpu = &config.gpu;
    if gpu.device != 0 {
        return Err(EngineError::new(format!(
            "gpu.device {} is not supported, cuvs resources run on device 0",
            gpu.device
        )));
    }
    if !gpu.store_dataset {
        return Err(EngineError::new(
            "gpu.store_dataset = false is not supported, hnswlib conversion reads the attached dataset",
        ));
    }
    if !config.cpu.base_level_only {
        return Err(EngineError::new(
            "cpu.base_level_only = false is not supported, cagra serializes the base level only",
        ));
    }
    if gpu.graph_build_algo == GraphBuildAlgo::IvfPq {
        let derived = assemble(
            &ConfigOverrides::default(),
            &DerivedParams {
                doc_count: rows,
                dimension: dim,
                metric: config.metric,
            },
        )
        .map_err(|e| EngineError::new(e.to_string()))?;
        if gpu.ivf_pq_build != derived.gpu.ivf_pq_build
            || gpu.ivf_pq_search != derived.gpu.ivf_pq_search
        {
            return Err(EngineError::new(
                "gpu.ivf_pq_build and gpu.ivf_pq_search overrides are not supported, cagra derives its own IVF-PQ parameters",
            ));
        }
    }
    Ok(())
}

fn normalize(row: &mut [f32]) {
    let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        row.iter_mut().for_each(|v| *v /= norm);
    }
}

impl IndexEngine for CuvsEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Faiss
    }

    fn build_gpu_index(
        &self,
        dataset: &VectorsDataset,
        config: &IndexBuildConfig,
    ) -> EngineResult<NativeIndex> {
        let rows = dataset.doc_count();
        let dim = dataset.dimension();
        check_supported(config, rows, dim)?;

        let mut values = Vec::with_capacity(rows * dim);
        for row in 0..rows {
            let mut row = dataset
                .row_f32(row)
                .map_err(|e| EngineError::new(e.to_string()))?;
            if config.metric == SpaceType::Cosine {
                normalize(&mut row);
            }
            values.extend(row);
        }
        let matrix = ndarray::Array2::from_shape_vec((rows, dim), values)
            .map_err(|e| EngineError::new(format!("shaping dataset: {e}")))?;
        let ids: Vec<i64> = dataset
            .doc_ids()
            .map_err(|e| EngineError::new(e.to_string()))?
            .collect();

        let params = Self::index_params(config)?;
        let index = {
            let res = self.resources();
            Index::build(&res, &params, &matrix).map_err(engine_err("cagra build"))?
        };

        let mut arena = self.arena();
        let gpu = arena.alloc(Structure::Gpu(DeviceIndex(index)));
        let id_map = arena.alloc(Structure::IdMap { ids, target: gpu });
        debug!(index = %gpu, %id_map, rows, dim, "built cagra index");
        Ok(NativeIndex::gpu(gpu, Some(id_map)))
    }

    fn convert_to_cpu(&self, gpu: &NativeIndex, _config: &CpuSearchConfig) -> EngineResult<RawHandle> {
        let id_map = gpu
            .id_map
            .ok_or_else(|| EngineError::new("GPU index has no id map"))?;
        let scratch = tempfile::NamedTempFile::new()
            .map_err(|e| EngineError::new(format!("creating conversion file: {e}")))?;
        let scratch_path = scratch.path().to_string_lossy().into_owned();

        let mut arena = self.arena();
        match arena.structures.get(&gpu.index.get()) {
            Some(Structure::Gpu(DeviceIndex(index))) => {
                let res = self.resources();
                index
                    .serialize_to_hnswlib(&res, &scratch_path)
                    .map_err(engine_err("serializing to hnswlib"))?;
            }
            _ => return Err(EngineError::new(format!("{} is not a GPU index", gpu.index))),
        }
        let graph = std::fs::read(scratch.path())
            .map_err(|e| EngineError::new(format!("reading hnswlib graph: {e}")))?;

        let cpu = arena.alloc(Structure::Cpu(graph));
        match arena.structures.get_mut(&id_map.get()) {
            Some(Structure::IdMap { target, .. }) => {
                *target = cpu;
                Ok(cpu)
            }
            _ => Err(EngineError::with_partial(
                format!("{id_map} is not an id map"),
                NativeIndex::cpu(cpu, None),
            )),
        }
    }

    fn persist(&self, cpu: &NativeIndex, destination: PersistDestination<'_>) -> EngineResult<()> {
        let arena = self.arena();
        let graph = match arena.structures.get(&cpu.index.get()) {
            Some(Structure::Cpu(graph)) => graph,
            _ => return Err(EngineError::new(format!("{} is not a CPU index", cpu.index))),
        };
        let ids = match cpu.id_map.and_then(|raw| arena.structures.get(&raw.get())) {
            Some(Structure::IdMap { ids, target }) if *target == cpu.index => ids,
            _ => return Err(EngineError::new("CPU index has no id map")),
        };

        let mut bytes = Vec::with_capacity(16 + ids.len() * 8 + graph.len());
        bytes.extend_from_slice(ARTIFACT_MAGIC);
        bytes.extend_from_slice(&(ids.len() as u64).to_le_bytes());
        for id in ids {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        bytes.extend_from_slice(graph);

        match destination {
            PersistDestination::File(path) => std::fs::write(path, &bytes)
                .map_err(|e| EngineError::new(format!("writing {}: {e}", path.display()))),
            PersistDestination::Buffer(buf) => {
                buf.extend_from_slice(&bytes);
                Ok(())
            }
        }
    }

    fn release(&self, raw: RawHandle, kind: NativeKind) -> EngineResult<()> {
        let mut arena = self.arena();
        match arena.structures.get(&raw.get()).map(Structure::kind) {
            Some(actual) if actual == kind => {
                // Dropping a device index frees its device memory.
                arena.structures.remove(&raw.get());
                Ok(())
            }
            Some(actual) => Err(EngineError::new(format!(
                "release of {raw} as {kind}, but it is a {actual}"
            ))),
            None => Err(EngineError::new(format!("double release of {kind} {raw}"))),
        }
    }
}
