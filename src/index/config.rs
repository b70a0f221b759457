//! Fully-populated index build configuration.
//!
//! These are the values handed to the Index Engine. They are produced by
//! [`crate::index::assembler::assemble`] and are always validated; nothing
//! downstream re-checks ranges.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{BuilderError, Result};
use crate::types::SpaceType;

/// Vectors per IVF list used to derive `n_lists` from the document count.
pub const VECTORS_PER_IVF_LIST: usize = 1_000;

/// Algorithm used to build the intermediate kNN graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphBuildAlgo {
    #[default]
    #[serde(rename = "IVF_PQ")]
    IvfPq,
    #[serde(rename = "NN_DESCENT")]
    NnDescent,
}

impl GraphBuildAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphBuildAlgo::IvfPq => "IVF_PQ",
            GraphBuildAlgo::NnDescent => "NN_DESCENT",
        }
    }
}

impl FromStr for GraphBuildAlgo {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IVF_PQ" => Ok(GraphBuildAlgo::IvfPq),
            "NN_DESCENT" => Ok(GraphBuildAlgo::NnDescent),
            other => Err(BuilderError::config_field(
                "gpu.graph_build_algo",
                format!("unknown graph build algorithm '{other}'"),
            )),
        }
    }
}

/// IVF-PQ parameters used when the kNN graph is built with [`GraphBuildAlgo::IvfPq`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfPqBuildConfig {
    /// Number of inverted lists (clusters).
    pub n_lists: usize,
    /// Iterations searching for k-means centers.
    pub kmeans_n_iters: usize,
    /// Fraction of the dataset used for k-means training, in (0, 1].
    pub kmeans_trainset_fraction: f64,
    /// Bit length of a PQ code element, 4..=8.
    pub pq_bits: u32,
    /// Dimensionality after PQ compression.
    pub pq_dim: usize,
    /// Allocate only the memory needed for the current records.
    pub conservative_memory_allocation: bool,
}

impl Default for IvfPqBuildConfig {
    fn default() -> Self {
        Self {
            n_lists: 1000,
            kmeans_n_iters: 10,
            kmeans_trainset_fraction: 0.1,
            pq_bits: 8,
            pq_dim: 16,
            conservative_memory_allocation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfPqSearchConfig {
    /// Number of lists probed while building the graph.
    pub n_probes: usize,
}

impl Default for IvfPqSearchConfig {
    fn default() -> Self {
        Self { n_probes: 20 }
    }
}

/// GPU (CAGRA) graph construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuIndexConfig {
    /// Degree of the input graph before pruning.
    pub intermediate_graph_degree: usize,
    /// Degree of the output graph.
    pub graph_degree: usize,
    pub graph_build_algo: GraphBuildAlgo,
    /// Keep a copy of the dataset on the device index.
    pub store_dataset: bool,
    /// CUDA device ordinal.
    pub device: u32,
    pub ivf_pq_build: IvfPqBuildConfig,
    pub ivf_pq_search: IvfPqSearchConfig,
}

impl Default for GpuIndexConfig {
    fn default() -> Self {
        Self {
            intermediate_graph_degree: 128,
            graph_degree: 64,
            graph_build_algo: GraphBuildAlgo::IvfPq,
            store_dataset: true,
            device: 0,
            ivf_pq_build: IvfPqBuildConfig::default(),
            ivf_pq_search: IvfPqSearchConfig::default(),
        }
    }
}

/// Parameters of the host-side HNSW index the GPU graph is copied into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSearchConfig {
    pub ef_search: usize,
    pub ef_construction: usize,
    /// Copy the graph into the base level only. The result is immutable.
    pub base_level_only: bool,
}

impl Default for CpuSearchConfig {
    fn default() -> Self {
        Self {
            ef_search: 100,
            ef_construction: 100,
            base_level_only: true,
        }
    }
}

/// The complete configuration of one index build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexBuildConfig {
    pub metric: SpaceType,
    pub gpu: GpuIndexConfig,
    pub cpu: CpuSearchConfig,
}

fn require_positive(field: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(BuilderError::config_field(field, "must be positive"));
    }
    Ok(())
}

impl IndexBuildConfig {
    /// Check every numeric knob against its allowed range.
    pub fn validate(&self) -> Result<()> {
        let gpu = &self.gpu;
        require_positive("gpu.intermediate_graph_degree", gpu.intermediate_graph_degree)?;
        require_positive("gpu.graph_degree", gpu.graph_degree)?;
        if gpu.graph_degree > gpu.intermediate_graph_degree {
            return Err(BuilderError::config_field(
                "gpu.graph_degree",
                format!(
                    "must not exceed intermediate_graph_degree ({})",
                    gpu.intermediate_graph_degree
                ),
            ));
        }

        let build = &gpu.ivf_pq_build;
        require_positive("gpu.ivf_pq_build_params.n_lists", build.n_lists)?;
        require_positive("gpu.ivf_pq_build_params.kmeans_n_iters", build.kmeans_n_iters)?;
        require_positive("gpu.ivf_pq_build_params.pq_dim", build.pq_dim)?;
        if !(build.kmeans_trainset_fraction > 0.0 && build.kmeans_trainset_fraction <= 1.0) {
            return Err(BuilderError::config_field(
                "gpu.ivf_pq_build_params.kmeans_trainset_fraction",
                "must be in (0, 1]",
            ));
        }
        if !(4..=8).contains(&build.pq_bits) {
            return Err(BuilderError::config_field(
                "gpu.ivf_pq_build_params.pq_bits",
                "must be between 4 and 8",
            ));
        }
        require_positive("gpu.ivf_pq_search_params.n_probes", gpu.ivf_pq_search.n_probes)?;

        require_positive("cpu.ef_search", self.cpu.ef_search)?;
        require_positive("cpu.ef_construction", self.cpu.ef_construction)?;
        Ok(())
    }

    /// Flat key/value view of the GPU configuration, keyed the way overrides are.
    pub fn gpu_flat_map(&self) -> BTreeMap<String, serde_json::Value> {
        let gpu = &self.gpu;
        let build = &gpu.ivf_pq_build;
        let mut map = BTreeMap::new();
        map.insert("intermediate_graph_degree".into(), gpu.intermediate_graph_degree.into());
        map.insert("graph_degree".into(), gpu.graph_degree.into());
        map.insert("graph_build_algo".into(), gpu.graph_build_algo.as_str().into());
        map.insert("store_dataset".into(), gpu.store_dataset.into());
        map.insert("device".into(), gpu.device.into());
        map.insert("ivf_pq_build_params.n_lists".into(), build.n_lists.into());
        map.insert("ivf_pq_build_params.kmeans_n_iters".into(), build.kmeans_n_iters.into());
        map.insert(
            "ivf_pq_build_params.kmeans_trainset_fraction".into(),
            build.kmeans_trainset_fraction.into(),
        );
        map.insert("ivf_pq_build_params.pq_bits".into(), build.pq_bits.into());
        map.insert("ivf_pq_build_params.pq_dim".into(), build.pq_dim.into());
        map.insert(
            "ivf_pq_build_params.conservative_memory_allocation".into(),
            build.conservative_memory_allocation.into(),
        );
        map.insert("ivf_pq_search_params.n_probes".into(), gpu.ivf_pq_search.n_probes.into());
        map
    }

    /// Flat key/value view of the CPU search configuration.
    pub fn cpu_flat_map(&self) -> BTreeMap<String, serde_json::Value> {
        let mut map = BTreeMap::new();
        map.insert("ef_search".into(), self.cpu.ef_search.into());
        map.insert("ef_construction".into(), self.cpu.ef_construction.into());
        map.insert("base_level_only".into(), self.cpu.base_level_only.into());
        map
    }
}

/// Number of IVF lists for a dataset of `doc_count` vectors.
pub fn ivf_pq_n_lists(doc_count: usize) -> usize {
    (doc_count / VECTORS_PER_IVF_LIST).max(1)
}

/// Default PQ dimensionality for vectors of `dimension` components.
///
/// Prefers a quarter of the dimension, then half, so the result divides the
/// dimension evenly.
pub fn ivf_pq_dim(dimension: usize) -> usize {
    if dimension >= 32 && dimension % 4 == 0 {
        dimension / 4
    } else if dimension >= 16 && dimension % 2 == 0 {
        dimension / 2
    } else {
        dimension.max(1)
    }
}
