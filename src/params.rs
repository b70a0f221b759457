//! Build request model.
//!
//! [`BuildRequest`] is the wire shape of a request. [`BuildParameters`] is the
//! validated form the pipeline runs on; it can only be obtained through
//! `BuildParameters::try_from`, so invalid requests never reach a stage.

use serde::{Deserialize, Serialize};

use crate::dataset::DOC_ID_SIZE;
use crate::error::{BuilderError, Result};
use crate::index::assembler::{ConfigOverrides, CpuConfigPatch, DerivedParams, GpuConfigPatch};
use crate::index::config::GpuIndexConfig;
use crate::types::{DataType, EngineKind, SerializationMode, SpaceType};

pub const VECTOR_FILE_EXTENSION: &str = ".knnvec";
pub const DOC_ID_FILE_EXTENSION: &str = ".knndid";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_construction: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,
    /// HNSW max connections per node. The GPU graph degree is twice this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParameters {
    #[serde(default)]
    pub space_type: SpaceType,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub algorithm_parameters: AlgorithmParameters,
}

impl Default for IndexParameters {
    fn default() -> Self {
        Self {
            space_type: SpaceType::default(),
            algorithm: default_algorithm(),
            algorithm_parameters: AlgorithmParameters::default(),
        }
    }
}

fn default_algorithm() -> String {
    "hnsw".to_string()
}

fn default_repository_type() -> String {
    "s3".to_string()
}

/// A build request as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(default = "default_repository_type")]
    pub repository_type: String,
    pub container_name: String,
    pub vector_path: String,
    pub doc_id_path: String,
    pub dimension: i64,
    pub doc_count: i64,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default)]
    pub index_parameters: IndexParameters,
    #[serde(default)]
    pub serialization_mode: SerializationMode,
    #[serde(default)]
    pub config_overrides: Option<ConfigOverrides>,
}

/// Validated, immutable description of one build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildParameters {
    repository_type: String,
    container_name: String,
    vector_path: String,
    doc_id_path: String,
    dimension: usize,
    doc_count: usize,
    data_type: DataType,
    engine: EngineKind,
    index_parameters: IndexParameters,
    serialization_mode: SerializationMode,
    config_overrides: ConfigOverrides,
    vector_blob_len: usize,
    doc_id_blob_len: usize,
}

impl TryFrom<BuildRequest> for BuildParameters {
    type Error = BuilderError;

    fn try_from(request: BuildRequest) -> Result<Self> {
        if request.repository_type.trim().is_empty() {
            return Err(invalid("repository_type must not be empty"));
        }
        if request.container_name.trim().is_empty() {
            return Err(invalid("container_name must not be empty"));
        }
        check_path("vector_path", &request.vector_path, VECTOR_FILE_EXTENSION)?;
        check_path("doc_id_path", &request.doc_id_path, DOC_ID_FILE_EXTENSION)?;

        let dimension = positive("dimension", request.dimension)?;
        let doc_count = positive("doc_count", request.doc_count)?;
        let vector_blob_len = doc_count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(request.data_type.source_element_size()))
            .ok_or_else(|| {
                invalid(format!(
                    "{doc_count} x {dimension} {} vectors do not fit in memory",
                    request.data_type
                ))
            })?;
        let doc_id_blob_len = doc_count
            .checked_mul(DOC_ID_SIZE)
            .ok_or_else(|| invalid(format!("{doc_count} document ids do not fit in memory")))?;

        if request.data_type == DataType::Binary {
            return Err(invalid("data_type 'binary' is not supported by the GPU graph build"));
        }
        if request.index_parameters.algorithm != "hnsw" {
            return Err(invalid(format!(
                "algorithm '{}' is not supported, expected 'hnsw'",
                request.index_parameters.algorithm
            )));
        }

        let algo = &request.index_parameters.algorithm_parameters;
        for (name, value) in [
            ("ef_construction", algo.ef_construction),
            ("ef_search", algo.ef_search),
            ("m", algo.m),
        ] {
            if value == Some(0) {
                return Err(invalid(format!(
                    "algorithm_parameters.{name} must be greater than 0"
                )));
            }
        }

        Ok(Self {
            repository_type: request.repository_type,
            container_name: request.container_name,
            vector_path: request.vector_path,
            doc_id_path: request.doc_id_path,
            dimension,
            doc_count,
            data_type: request.data_type,
            engine: request.engine,
            index_parameters: request.index_parameters,
            serialization_mode: request.serialization_mode,
            config_overrides: request.config_overrides.unwrap_or_default(),
            vector_blob_len,
            doc_id_blob_len,
        })
    }
}

fn invalid(reason: impl Into<String>) -> BuilderError {
    BuilderError::InvalidParameters(reason.into())
}

fn positive(field: &str, value: i64) -> Result<usize> {
    if value <= 0 {
        return Err(invalid(format!("{field} must be greater than 0, got {value}")));
    }
    usize::try_from(value).map_err(|_| invalid(format!("{field} is out of range: {value}")))
}

fn check_path(field: &str, path: &str, extension: &str) -> Result<()> {
    let stem = path.strip_suffix(extension).unwrap_or_default();
    if stem.is_empty() || stem.ends_with('/') {
        return Err(invalid(format!(
            "{field} must name a '{extension}' file, got '{path}'"
        )));
    }
    Ok(())
}

impl BuildParameters {
    pub fn repository_type(&self) -> &str {
        &self.repository_type
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn vector_path(&self) -> &str {
        &self.vector_path
    }

    pub fn doc_id_path(&self) -> &str {
        &self.doc_id_path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn space_type(&self) -> SpaceType {
        self.index_parameters.space_type
    }

    pub fn index_parameters(&self) -> &IndexParameters {
        &self.index_parameters
    }

    pub fn serialization_mode(&self) -> SerializationMode {
        self.serialization_mode
    }

    pub fn config_overrides(&self) -> &ConfigOverrides {
        &self.config_overrides
    }

    /// Size in bytes of the remote vector blob.
    pub fn vector_blob_len(&self) -> usize {
        self.vector_blob_len
    }

    /// Size in bytes of the remote document-id blob.
    pub fn doc_id_blob_len(&self) -> usize {
        self.doc_id_blob_len
    }

    /// Remote path of the artifact: the vector path with `.knnvec` replaced
    /// by the engine extension.
    pub fn artifact_path(&self) -> String {
        artifact_path(&self.vector_path, self.engine)
    }

    pub fn derived_params(&self) -> DerivedParams {
        DerivedParams {
            doc_count: self.doc_count,
            dimension: self.dimension,
            metric: self.space_type(),
        }
    }

    /// Overrides with the HNSW algorithm parameters folded in. Values set
    /// explicitly in `config_overrides` take precedence.
    pub fn effective_overrides(&self) -> ConfigOverrides {
        let mut overrides = self.config_overrides.clone();
        let algo = &self.index_parameters.algorithm_parameters;

        if algo.ef_search.is_some() || algo.ef_construction.is_some() {
            let cpu = overrides.hnsw_config.get_or_insert_with(CpuConfigPatch::default);
            if cpu.ef_search.is_none() {
                cpu.ef_search = algo.ef_search;
            }
            if cpu.ef_construction.is_none() {
                cpu.ef_construction = algo.ef_construction;
            }
        }

        if let Some(m) = algo.m {
            let gpu = overrides.gpu_config.get_or_insert_with(GpuConfigPatch::default);
            if gpu.graph_degree.is_none() {
                gpu.graph_degree = Some(2 * m);
            }
            // The pruned graph must not be wider than the graph it is pruned from.
            if gpu.intermediate_graph_degree.is_none() {
                let default = GpuIndexConfig::default().intermediate_graph_degree;
                let graph_degree = gpu.graph_degree.unwrap_or(2 * m);
                if graph_degree > default {
                    gpu.intermediate_graph_degree = Some(2 * graph_degree);
                }
            }
        }

        overrides
    }
}

/// `a/b/c.knnvec` becomes `a/b/c.<engine extension>`.
pub fn artifact_path(vector_path: &str, engine: EngineKind) -> String {
    let stem = vector_path
        .strip_suffix(VECTOR_FILE_EXTENSION)
        .unwrap_or(vector_path);
    format!("{stem}.{}", engine.extension())
}

/// Final path segment of a remote path.
pub fn base_name(remote_path: &str) -> &str {
    remote_path.rsplit('/').next().unwrap_or(remote_path)
}
