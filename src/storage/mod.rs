//! Object store access for build inputs and artifacts.
//!
//! [`ObjectStoreClient`] is the contract the pipeline consumes. [`BlobStore`]
//! implements it over any `object_store` backend; [`ObjectStoreFactory`]
//! resolves the backend from the repository type of a request.

pub mod blob_store;
pub mod factory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::dataset::BlobSink;
use crate::error::Result;
use crate::params::BuildParameters;

pub use blob_store::BlobStore;
pub use factory::ObjectStoreFactory;

/// Content to upload.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    File(PathBuf),
    Buffer(Bytes),
}

/// Reads and writes opaque blobs by path.
///
/// Each call either completes fully or fails with a single storage error.
/// A short read is an error, never a success.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Stream `remote_path` into `sink`. Returns the number of bytes read.
    async fn read_blob(&self, remote_path: &str, sink: &mut dyn BlobSink) -> Result<u64>;

    /// Upload `source` to `remote_path`. Returns the path written.
    async fn write_blob(&self, source: &ArtifactSource, remote_path: &str) -> Result<String>;
}

/// Resolves the object store a build request reads from and writes to.
pub trait ObjectStoreProvider: Send + Sync {
    fn object_store(&self, params: &BuildParameters) -> Result<Arc<dyn ObjectStoreClient>>;
}
