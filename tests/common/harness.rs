use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tempfile::TempDir;

use remote_index_builder::config::{PipelineConfig, TransferConfig};
use remote_index_builder::dataset::BlobSink;
use remote_index_builder::error::{BuilderError, Result};
use remote_index_builder::index::IndexEngine;
use remote_index_builder::params::{BuildParameters, BuildRequest, IndexParameters};
use remote_index_builder::pipeline::BuildPipeline;
use remote_index_builder::storage::{
    ArtifactSource, BlobStore, ObjectStoreClient, ObjectStoreProvider,
};
use remote_index_builder::types::{DataType, EngineKind, SerializationMode};

use super::vectors::{encode_f32, encode_ids, random_vectors, sequential_ids};

/// Hands out the same client for every request.
pub struct StaticProvider(pub Arc<dyn ObjectStoreClient>);

impl ObjectStoreProvider for StaticProvider {
    fn object_store(&self, _params: &BuildParameters) -> Result<Arc<dyn ObjectStoreClient>> {
        Ok(self.0.clone())
    }
}

/// Wraps a client and fails reads or writes.
pub struct FailingStore {
    pub inner: BlobStore,
    pub fail_reads: bool,
    pub fail_writes: bool,
}

#[async_trait]
impl ObjectStoreClient for FailingStore {
    async fn read_blob(&self, remote_path: &str, sink: &mut dyn BlobSink) -> Result<u64> {
        if self.fail_reads {
            return Err(BuilderError::BlobRead {
                path: remote_path.to_string(),
                reason: "injected read failure".to_string(),
            });
        }
        self.inner.read_blob(remote_path, sink).await
    }

    async fn write_blob(&self, source: &ArtifactSource, remote_path: &str) -> Result<String> {
        if self.fail_writes {
            return Err(BuilderError::BlobWrite {
                path: remote_path.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        self.inner.write_blob(source, remote_path).await
    }
}

/// An in-memory object store plus a private staging root.
pub struct TestHarness {
    pub memory: Arc<InMemory>,
    pub store: BlobStore,
    pub staging: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_transfer(TransferConfig::default())
    }

    pub fn with_transfer(transfer: TransferConfig) -> Self {
        let memory = Arc::new(InMemory::new());
        let store = BlobStore::new(memory.clone(), transfer);
        Self {
            memory,
            store,
            staging: TempDir::new().expect("failed to create staging root"),
        }
    }

    pub async fn put(&self, key: &str, data: Bytes) {
        self.memory
            .put(&Path::from(key), PutPayload::from(data))
            .await
            .expect("put should succeed");
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.memory.get(&Path::from(key)).await {
            Ok(result) => Some(result.bytes().await.expect("read should succeed")),
            Err(object_store::Error::NotFound { .. }) => None,
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }

    /// Upload a random float dataset as `<prefix>.knnvec` / `<prefix>.knndid`.
    /// Returns the vectors.
    pub async fn put_random_dataset(&self, prefix: &str, n: usize, dims: usize) -> Vec<Vec<f32>> {
        let vectors = random_vectors(n, dims);
        self.put(&format!("{prefix}.knnvec"), encode_f32(&vectors)).await;
        self.put(&format!("{prefix}.knndid"), encode_ids(&sequential_ids(n, 0)))
            .await;
        vectors
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            staging_dir: self.staging.path().to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    pub fn pipeline(&self, engine: Arc<dyn IndexEngine>) -> BuildPipeline {
        self.pipeline_with_store(engine, Arc::new(self.store.clone()))
    }

    pub fn pipeline_with_store(
        &self,
        engine: Arc<dyn IndexEngine>,
        store: Arc<dyn ObjectStoreClient>,
    ) -> BuildPipeline {
        BuildPipeline::new(engine, Arc::new(StaticProvider(store)), self.pipeline_config())
    }

    /// Entries left under the staging root.
    pub fn staging_entries(&self) -> usize {
        std::fs::read_dir(self.staging.path())
            .expect("staging root should exist")
            .count()
    }
}

/// A request for a float dataset stored under `prefix`.
pub fn request(prefix: &str, doc_count: i64, dimension: i64) -> BuildRequest {
    BuildRequest {
        repository_type: "s3".to_string(),
        container_name: "test-bucket".to_string(),
        vector_path: format!("{prefix}.knnvec"),
        doc_id_path: format!("{prefix}.knndid"),
        dimension,
        doc_count,
        data_type: DataType::Float,
        engine: EngineKind::Faiss,
        index_parameters: IndexParameters::default(),
        serialization_mode: SerializationMode::Memory,
        config_overrides: None,
    }
}

pub fn params(prefix: &str, doc_count: i64, dimension: i64) -> BuildParameters {
    BuildParameters::try_from(request(prefix, doc_count, dimension)).expect("valid request")
}
