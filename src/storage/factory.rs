use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ObjectStore, RetryConfig};
use tracing::info;

use crate::config::StorageConfig;
use crate::error::{BuilderError, Result};
use crate::params::BuildParameters;

use super::{BlobStore, ObjectStoreClient, ObjectStoreProvider};

pub const REPOSITORY_S3: &str = "s3";
pub const REPOSITORY_FS: &str = "fs";

/// Everything a transport client is configured with. A different value means
/// a different client; cached clients are never reconfigured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    repository_type: String,
    container: String,
    region: String,
    retries: usize,
    endpoint: Option<String>,
    allow_http: bool,
    local_root: PathBuf,
}

lazy_static::lazy_static! {
    static ref CLIENTS: DashMap<ClientKey, Arc<dyn ObjectStore>> = DashMap::new();
}

/// Number of transport clients created by this process.
pub fn cached_clients() -> usize {
    CLIENTS.len()
}

/// Resolves `s3` and `fs` repositories, reusing transport clients across runs.
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreFactory {
    config: StorageConfig,
}

impl ObjectStoreFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn transport(&self, repository_type: &str, container: &str) -> Result<Arc<dyn ObjectStore>> {
        if repository_type != REPOSITORY_S3 && repository_type != REPOSITORY_FS {
            return Err(BuilderError::UnsupportedRepositoryType {
                repository_type: repository_type.to_string(),
            });
        }

        let key = ClientKey {
            repository_type: repository_type.to_string(),
            container: container.to_string(),
            region: self.config.region.clone(),
            retries: self.config.retries,
            endpoint: self.config.endpoint.clone(),
            allow_http: self.config.allow_http,
            local_root: self.config.local_root.clone(),
        };

        let entry = CLIENTS.entry(key).or_try_insert_with(|| {
            let store = match repository_type {
                REPOSITORY_S3 => self.build_s3(container)?,
                _ => self.build_local(container)?,
            };
            info!(
                repository_type,
                container,
                region = %self.config.region,
                retries = self.config.retries,
                "created object store client"
            );
            Ok::<_, BuilderError>(store)
        })?;
        Ok(entry.value().clone())
    }

    fn build_s3(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let retry = RetryConfig {
            max_retries: self.config.retries,
            ..RetryConfig::default()
        };
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(&self.config.region)
            .with_retry(retry)
            .with_allow_http(self.config.allow_http);
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        Ok(Arc::new(builder.build()?))
    }

    fn build_local(&self, container: &str) -> Result<Arc<dyn ObjectStore>> {
        let root = self.config.local_root.join(container);
        std::fs::create_dir_all(&root)?;
        Ok(Arc::new(LocalFileSystem::new_with_prefix(&root)?))
    }
}

impl ObjectStoreProvider for ObjectStoreFactory {
    fn object_store(&self, params: &BuildParameters) -> Result<Arc<dyn ObjectStoreClient>> {
        let transport = self.transport(params.repository_type(), params.container_name())?;
        let store =
            BlobStore::new(transport, self.config.transfer.clone()).with_debug(self.config.debug);
        Ok(Arc::new(store))
    }
}
