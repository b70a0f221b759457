//! Turns a sparse override tree into a complete [`IndexBuildConfig`].
//!
//! Precedence for every knob is: explicit override, then a value derived from
//! the dataset, then the built-in default. An absent sub-tree falls back to
//! defaults as a whole. Assembly is a pure function of its two arguments.

use serde::{Deserialize, Serialize};

use crate::error::{BuilderError, Result};
use crate::index::config::{
    ivf_pq_dim, ivf_pq_n_lists, CpuSearchConfig, GpuIndexConfig, GraphBuildAlgo,
    IndexBuildConfig, IvfPqBuildConfig, IvfPqSearchConfig,
};
use crate::types::SpaceType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IvfPqBuildPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_lists: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kmeans_n_iters: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kmeans_trainset_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pq_bits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pq_dim: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conservative_memory_allocation: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IvfPqSearchPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_probes: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_graph_degree: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_degree: Option<usize>,
    /// Kept as text so an unknown variant is reported with its field name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_build_algo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dataset: Option<bool>,
    /// Signed so that a negative ordinal is rejected by validation, not by the parser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ivf_pq_build_params: Option<IvfPqBuildPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ivf_pq_search_params: Option<IvfPqSearchPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_construction: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_level_only: Option<bool>,
}

/// Partial configuration tree supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_config: Option<GpuConfigPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw_config: Option<CpuConfigPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
}

impl ConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.gpu_config.is_none() && self.hnsw_config.is_none() && self.metric.is_none()
    }
}

/// Dataset-dependent inputs to assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedParams {
    pub doc_count: usize,
    pub dimension: usize,
    pub metric: SpaceType,
}

/// Overlay `overrides` on the defaults and validate the result.
pub fn assemble(overrides: &ConfigOverrides, derived: &DerivedParams) -> Result<IndexBuildConfig> {
    let metric = match overrides.metric.as_deref() {
        Some(name) => name.parse::<SpaceType>()?,
        None => derived.metric,
    };

    let config = IndexBuildConfig {
        metric,
        gpu: assemble_gpu(overrides.gpu_config.as_ref(), derived)?,
        cpu: assemble_cpu(overrides.hnsw_config.as_ref()),
    };
    config.validate()?;
    Ok(config)
}

fn assemble_gpu(patch: Option<&GpuConfigPatch>, derived: &DerivedParams) -> Result<GpuIndexConfig> {
    let defaults = GpuIndexConfig::default();
    let empty = GpuConfigPatch::default();
    let patch = patch.unwrap_or(&empty);

    let graph_build_algo = match patch.graph_build_algo.as_deref() {
        Some(name) => name.parse::<GraphBuildAlgo>()?,
        None => defaults.graph_build_algo,
    };

    let device = match patch.device {
        Some(d) if d < 0 => {
            return Err(BuilderError::config_field("gpu.device", "must be non-negative"))
        }
        Some(d) => u32::try_from(d)
            .map_err(|_| BuilderError::config_field("gpu.device", "out of range"))?,
        None => defaults.device,
    };

    Ok(GpuIndexConfig {
        intermediate_graph_degree: patch
            .intermediate_graph_degree
            .unwrap_or(defaults.intermediate_graph_degree),
        graph_degree: patch.graph_degree.unwrap_or(defaults.graph_degree),
        graph_build_algo,
        store_dataset: patch.store_dataset.unwrap_or(defaults.store_dataset),
        device,
        ivf_pq_build: assemble_ivf_pq_build(patch.ivf_pq_build_params.as_ref(), derived),
        ivf_pq_search: assemble_ivf_pq_search(patch.ivf_pq_search_params.as_ref()),
    })
}

fn assemble_ivf_pq_build(patch: Option<&IvfPqBuildPatch>, derived: &DerivedParams) -> IvfPqBuildConfig {
    let defaults = IvfPqBuildConfig::default();
    let empty = IvfPqBuildPatch::default();
    let patch = patch.unwrap_or(&empty);

    IvfPqBuildConfig {
        n_lists: patch.n_lists.unwrap_or_else(|| ivf_pq_n_lists(derived.doc_count)),
        kmeans_n_iters: patch.kmeans_n_iters.unwrap_or(defaults.kmeans_n_iters),
        kmeans_trainset_fraction: patch
            .kmeans_trainset_fraction
            .unwrap_or(defaults.kmeans_trainset_fraction),
        pq_bits: patch.pq_bits.unwrap_or(defaults.pq_bits),
        pq_dim: patch.pq_dim.unwrap_or_else(|| ivf_pq_dim(derived.dimension)),
        conservative_memory_allocation: patch
            .conservative_memory_allocation
            .unwrap_or(defaults.conservative_memory_allocation),
    }
}

fn assemble_ivf_pq_search(patch: Option<&IvfPqSearchPatch>) -> IvfPqSearchConfig {
    let defaults = IvfPqSearchConfig::default();
    IvfPqSearchConfig {
        n_probes: patch.and_then(|p| p.n_probes).unwrap_or(defaults.n_probes),
    }
}

fn assemble_cpu(patch: Option<&CpuConfigPatch>) -> CpuSearchConfig {
    let defaults = CpuSearchConfig::default();
    let empty = CpuConfigPatch::default();
    let patch = patch.unwrap_or(&empty);

    CpuSearchConfig {
        ef_search: patch.ef_search.unwrap_or(defaults.ef_search),
        ef_construction: patch.ef_construction.unwrap_or(defaults.ef_construction),
        base_level_only: patch.base_level_only.unwrap_or(defaults.base_level_only),
    }
}
