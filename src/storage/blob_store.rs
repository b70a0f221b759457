use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use crate::config::TransferConfig;
use crate::dataset::BlobSink;
use crate::error::{BuilderError, Result};

use super::{ArtifactSource, ObjectStoreClient};

/// [`ObjectStoreClient`] over an `object_store` backend.
///
/// Cheap to clone; the transport is shared.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn ObjectStore>,
    transfer: TransferConfig,
    debug: bool,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("inner", &self.inner.to_string())
            .field("transfer", &self.transfer)
            .field("debug", &self.debug)
            .finish()
    }
}

impl BlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>, transfer: TransferConfig) -> Self {
        Self {
            inner,
            transfer,
            debug: false,
        }
    }

    /// Log transfer progress per chunk.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The underlying transport.
    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }

    async fn put_buffer(&self, location: &Path, data: Bytes) -> Result<()> {
        if data.len() < self.transfer.multipart_threshold {
            self.inner.put(location, PutPayload::from(data)).await?;
            return Ok(());
        }

        let upload = self.inner.put_multipart(location).await?;
        let mut writer =
            WriteMultipart::new_with_chunk_size(upload, self.transfer.multipart_chunksize);
        let mut throttle = Throttle::new(self.transfer.max_bandwidth);
        let mut sent = 0u64;
        for chunk in data.chunks(self.transfer.io_chunksize) {
            if let Err(e) = writer.wait_for_capacity(self.transfer.max_concurrency).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
            writer.write(chunk);
            sent += chunk.len() as u64;
            self.progress("write", location, sent);
            throttle.consume(chunk.len() as u64).await;
        }
        writer.finish().await?;
        Ok(())
    }

    async fn put_file(&self, location: &Path, file: &std::path::Path) -> Result<()> {
        let mut reader = tokio::fs::File::open(file).await?;
        let len = reader.metadata().await?.len() as usize;

        if len < self.transfer.multipart_threshold {
            let mut data = Vec::with_capacity(len);
            reader.read_to_end(&mut data).await?;
            self.inner.put(location, PutPayload::from(data)).await?;
            self.progress("write", location, len as u64);
            return Ok(());
        }

        let upload = self.inner.put_multipart(location).await?;
        let mut writer =
            WriteMultipart::new_with_chunk_size(upload, self.transfer.multipart_chunksize);
        let mut throttle = Throttle::new(self.transfer.max_bandwidth);
        let mut buf = vec![0u8; self.transfer.io_chunksize];
        let mut sent = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = writer.wait_for_capacity(self.transfer.max_concurrency).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
            writer.write(&buf[..n]);
            sent += n as u64;
            self.progress("write", location, sent);
            throttle.consume(n as u64).await;
        }

        if sent as usize != len {
            let _ = writer.abort().await;
            return Err(BuilderError::BlobWrite {
                path: location.to_string(),
                reason: format!("file changed during upload: read {sent} of {len} bytes"),
            });
        }
        writer.finish().await?;
        Ok(())
    }

    fn progress(&self, direction: &str, location: &Path, bytes: u64) {
        if self.debug {
            debug!(direction, path = %location, bytes, "transfer progress");
        }
    }
}

#[async_trait]
impl ObjectStoreClient for BlobStore {
    #[instrument(skip(self, sink), fields(path = remote_path))]
    async fn read_blob(&self, remote_path: &str, sink: &mut dyn BlobSink) -> Result<u64> {
        let location = Path::parse(remote_path)?;
        let result = self.inner.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => BuilderError::NotFound {
                path: remote_path.to_string(),
            },
            other => BuilderError::BlobRead {
                path: remote_path.to_string(),
                reason: other.to_string(),
            },
        })?;
        let expected = result.meta.size as u64;
        sink.reserve(expected);

        let mut throttle = Throttle::new(self.transfer.max_bandwidth);
        let mut stream = result.into_stream();
        let mut read = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BuilderError::BlobRead {
                path: remote_path.to_string(),
                reason: e.to_string(),
            })?;
            sink.write_chunk(&chunk)?;
            read += chunk.len() as u64;
            self.progress("read", &location, read);
            throttle.consume(chunk.len() as u64).await;
        }

        if read != expected {
            return Err(BuilderError::BlobRead {
                path: remote_path.to_string(),
                reason: format!("short read: {read} of {expected} bytes"),
            });
        }
        sink.finish()?;

        crate::metrics::BLOB_BYTES_TOTAL
            .with_label_values(&["read"])
            .inc_by(read);
        debug!(bytes = read, "read blob");
        Ok(read)
    }

    #[instrument(skip(self, source), fields(path = remote_path))]
    async fn write_blob(&self, source: &ArtifactSource, remote_path: &str) -> Result<String> {
        let location = Path::parse(remote_path)?;
        let written = match source {
            ArtifactSource::Buffer(data) => {
                self.put_buffer(&location, data.clone()).await?;
                data.len() as u64
            }
            ArtifactSource::File(file) => {
                self.put_file(&location, file).await?;
                tokio::fs::metadata(file).await?.len()
            }
        };

        crate::metrics::BLOB_BYTES_TOTAL
            .with_label_values(&["write"])
            .inc_by(written);
        debug!(bytes = written, "wrote blob");
        Ok(remote_path.to_string())
    }
}

/// Paces a transfer to a byte rate.
struct Throttle {
    max_bandwidth: Option<u64>,
    started: Instant,
    transferred: u64,
}

impl Throttle {
    fn new(max_bandwidth: Option<u64>) -> Self {
        Self {
            max_bandwidth,
            started: Instant::now(),
            transferred: 0,
        }
    }

    async fn consume(&mut self, bytes: u64) {
        let Some(rate) = self.max_bandwidth else {
            return;
        };
        self.transferred += bytes;
        let due = Duration::from_secs_f64(self.transferred as f64 / rate as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }
}
