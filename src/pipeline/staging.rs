use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempDir;
use tracing::warn;

use crate::error::Result;
use crate::index::engine::PersistDestination;
use crate::params::base_name;
use crate::storage::ArtifactSource;
use crate::types::SerializationMode;

const STAGING_PREFIX: &str = "index-build-";

enum Target {
    File(PathBuf),
    Buffer(Vec<u8>),
}

/// Where one run persists its CPU index before upload.
///
/// Owns a temporary directory under the staging root for the whole run. The
/// directory, any file in it and the buffer are gone once this is dropped.
pub struct SerializationTarget {
    dir: TempDir,
    target: Target,
}

impl std::fmt::Debug for SerializationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.target {
            Target::File(path) => format!("file {}", path.display()),
            Target::Buffer(buf) => format!("buffer of {} bytes", buf.len()),
        };
        f.debug_struct("SerializationTarget")
            .field("dir", &self.dir.path())
            .field("target", &target)
            .finish()
    }
}

impl SerializationTarget {
    /// `artifact_path` names the file in disk mode; only its base name is used.
    pub fn create(
        staging_root: &Path,
        mode: SerializationMode,
        artifact_path: &str,
    ) -> Result<Self> {
        std::fs::create_dir_all(staging_root)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(staging_root)?;
        let target = match mode {
            SerializationMode::Disk => Target::File(dir.path().join(base_name(artifact_path))),
            SerializationMode::Memory => Target::Buffer(Vec::new()),
        };
        Ok(Self { dir, target })
    }

    pub fn mode(&self) -> SerializationMode {
        match self.target {
            Target::File(_) => SerializationMode::Disk,
            Target::Buffer(_) => SerializationMode::Memory,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn destination(&mut self) -> PersistDestination<'_> {
        match &mut self.target {
            Target::File(path) => PersistDestination::File(path.as_path()),
            Target::Buffer(buf) => PersistDestination::Buffer(buf),
        }
    }

    /// Bytes persisted so far.
    pub fn len(&self) -> u64 {
        match &self.target {
            Target::File(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            Target::Buffer(buf) => buf.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content to upload. A buffer is handed over without copying and the
    /// target is left empty.
    pub fn artifact_source(&mut self) -> ArtifactSource {
        match &mut self.target {
            Target::File(path) => ArtifactSource::File(path.clone()),
            Target::Buffer(buf) => ArtifactSource::Buffer(Bytes::from(std::mem::take(buf))),
        }
    }

    /// Remove the directory now, reporting failures instead of ignoring them.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(dir = %path.display(), error = %e, "failed to remove staging directory");
        }
    }
}
