mod common;

use common::harness::request;

use remote_index_builder::error::BuilderError;
use remote_index_builder::params::{artifact_path, base_name, BuildParameters, BuildRequest};
use remote_index_builder::types::{DataType, EngineKind, SerializationMode, SpaceType};

fn rejected(req: BuildRequest, needle: &str) {
    match BuildParameters::try_from(req) {
        Err(BuilderError::InvalidParameters(msg)) => {
            assert!(msg.contains(needle), "expected '{needle}' in '{msg}'")
        }
        Err(other) => panic!("expected invalid parameters, got {other}"),
        Ok(params) => panic!("expected rejection, got {params:?}"),
    }
}

// ─── Wire format ───

#[test]
fn test_request_deserializes_with_defaults() {
    let req: BuildRequest = serde_json::from_value(serde_json::json!({
        "container_name": "bucket",
        "vector_path": "seg/_0_field.knnvec",
        "doc_id_path": "seg/_0_field.knndid",
        "dimension": 768,
        "doc_count": 5000
    }))
    .unwrap();

    assert_eq!(req.repository_type, "s3");
    assert_eq!(req.data_type, DataType::Float);
    assert_eq!(req.engine, EngineKind::Faiss);
    assert_eq!(req.serialization_mode, SerializationMode::Disk);
    assert_eq!(req.index_parameters.space_type, SpaceType::L2);
    assert_eq!(req.index_parameters.algorithm, "hnsw");
    assert!(req.config_overrides.is_none());

    let params = BuildParameters::try_from(req).unwrap();
    assert_eq!(params.dimension(), 768);
    assert_eq!(params.vector_blob_len(), 5000 * 768 * 4);
}

#[test]
fn test_request_accepts_nested_parameters() {
    let req: BuildRequest = serde_json::from_value(serde_json::json!({
        "container_name": "bucket",
        "vector_path": "v.knnvec",
        "doc_id_path": "v.knndid",
        "dimension": 8,
        "doc_count": 10,
        "data_type": "float16",
        "serialization_mode": "memory",
        "index_parameters": {
            "space_type": "innerproduct",
            "algorithm_parameters": {"ef_construction": 200, "m": 24}
        },
        "config_overrides": {"gpu_config": {"device": 1}}
    }))
    .unwrap();
    let params = BuildParameters::try_from(req).unwrap();

    assert_eq!(params.data_type(), DataType::Float16);
    assert_eq!(params.space_type(), SpaceType::InnerProduct);
    assert_eq!(params.serialization_mode(), SerializationMode::Memory);
    assert_eq!(
        params.index_parameters().algorithm_parameters.ef_construction,
        Some(200)
    );
    // Narrowing happens after download; the remote blob is still f32.
    assert_eq!(params.vector_blob_len(), 10 * 8 * 4);
}

// ─── Validation ───

#[test]
fn test_rejects_empty_identifiers() {
    let mut req = request("v", 1, 1);
    req.repository_type = " ".to_string();
    rejected(req, "repository_type");

    let mut req = request("v", 1, 1);
    req.container_name = String::new();
    rejected(req, "container_name");
}

#[test]
fn test_rejects_bad_paths() {
    let mut req = request("v", 1, 1);
    req.vector_path = "v.bin".to_string();
    rejected(req, "vector_path");

    let mut req = request("v", 1, 1);
    req.vector_path = "dir/.knnvec".to_string();
    rejected(req, "vector_path");

    let mut req = request("v", 1, 1);
    req.doc_id_path = "v.knnvec".to_string();
    rejected(req, "doc_id_path");
}

#[test]
fn test_rejects_non_positive_shape() {
    rejected(request("v", 0, 8), "doc_count must be greater than 0");
    rejected(request("v", 10, -3), "dimension must be greater than 0");
}

#[test]
fn test_rejects_shape_that_overflows() {
    rejected(request("huge", 1 << 62, 4), "do not fit in memory");

    let mut req = request("ids", 1 << 62, 1);
    req.data_type = DataType::Byte;
    rejected(req, "document ids do not fit in memory");
}

#[test]
fn test_blob_lengths_follow_shape() {
    let params = BuildParameters::try_from(request("v", 1 << 40, 4)).unwrap();
    assert_eq!(params.vector_blob_len(), (1usize << 40) * 16);
    assert_eq!(params.doc_id_blob_len(), (1usize << 40) * 4);
}

#[test]
fn test_rejects_unsupported_build_options() {
    let mut req = request("v", 1, 8);
    req.data_type = DataType::Binary;
    rejected(req, "binary");

    let mut req = request("v", 1, 8);
    req.index_parameters.algorithm = "ivf".to_string();
    rejected(req, "algorithm 'ivf'");

    let mut req = request("v", 1, 8);
    req.index_parameters.algorithm_parameters.m = Some(0);
    rejected(req, "algorithm_parameters.m");
}

// ─── Derived values ───

#[test]
fn test_artifact_path_swaps_extension() {
    assert_eq!(artifact_path("a/b/c.knnvec", EngineKind::Faiss), "a/b/c.faiss");
    assert_eq!(artifact_path("a/b/c.knnvec", EngineKind::Nmslib), "a/b/c.nmslib");
    assert_eq!(
        BuildParameters::try_from(request("x/y", 1, 1))
            .unwrap()
            .artifact_path(),
        "x/y.faiss"
    );
}

#[test]
fn test_base_name() {
    assert_eq!(base_name("a/b/c.faiss"), "c.faiss");
    assert_eq!(base_name("c.faiss"), "c.faiss");
}

#[test]
fn test_algorithm_parameters_fold_into_overrides() {
    let mut req = request("v", 100, 8);
    req.index_parameters.algorithm_parameters.ef_search = Some(64);
    req.index_parameters.algorithm_parameters.ef_construction = Some(300);
    req.index_parameters.algorithm_parameters.m = Some(16);
    let overrides = BuildParameters::try_from(req).unwrap().effective_overrides();

    let cpu = overrides.hnsw_config.unwrap();
    assert_eq!(cpu.ef_search, Some(64));
    assert_eq!(cpu.ef_construction, Some(300));
    let gpu = overrides.gpu_config.unwrap();
    assert_eq!(gpu.graph_degree, Some(32));
    assert_eq!(gpu.intermediate_graph_degree, None);
}

#[test]
fn test_explicit_overrides_win_over_algorithm_parameters() {
    let mut req = request("v", 100, 8);
    req.index_parameters.algorithm_parameters.ef_search = Some(64);
    req.index_parameters.algorithm_parameters.m = Some(16);
    req.config_overrides = Some(
        serde_json::from_value(serde_json::json!({
            "gpu_config": {"graph_degree": 48},
            "hnsw_config": {"ef_search": 10}
        }))
        .unwrap(),
    );
    let overrides = BuildParameters::try_from(req).unwrap().effective_overrides();

    assert_eq!(overrides.hnsw_config.unwrap().ef_search, Some(10));
    assert_eq!(overrides.gpu_config.unwrap().graph_degree, Some(48));
}

#[test]
fn test_large_m_widens_intermediate_graph() {
    let mut req = request("v", 100, 8);
    req.index_parameters.algorithm_parameters.m = Some(96);
    let gpu = BuildParameters::try_from(req)
        .unwrap()
        .effective_overrides()
        .gpu_config
        .unwrap();

    assert_eq!(gpu.graph_degree, Some(192));
    assert_eq!(gpu.intermediate_graph_degree, Some(384));
}
