use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::BuilderError;

/// Element type of the staged vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Little-endian f32.
    #[default]
    Float,
    /// f32 on the wire, narrowed to f16 while staging.
    Float16,
    /// Signed 8-bit integers.
    Byte,
    /// Packed bits.
    Binary,
}

impl DataType {
    /// Size in bytes of one element as it sits in the remote vector blob.
    pub fn source_element_size(&self) -> usize {
        match self {
            DataType::Float | DataType::Float16 => 4,
            DataType::Byte | DataType::Binary => 1,
        }
    }

    /// Size in bytes of one element once staged in host memory.
    pub fn staged_element_size(&self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Float16 => 2,
            DataType::Byte | DataType::Binary => 1,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Float => write!(f, "float"),
            DataType::Float16 => write!(f, "float16"),
            DataType::Byte => write!(f, "byte"),
            DataType::Binary => write!(f, "binary"),
        }
    }
}

/// Distance metric the index is built for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceType {
    #[default]
    #[serde(rename = "l2")]
    L2,
    #[serde(rename = "innerproduct")]
    InnerProduct,
    #[serde(rename = "cosinesimil")]
    Cosine,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::L2 => "l2",
            SpaceType::InnerProduct => "innerproduct",
            SpaceType::Cosine => "cosinesimil",
        }
    }
}

impl std::fmt::Display for SpaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpaceType {
    type Err = BuilderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l2" => Ok(SpaceType::L2),
            "innerproduct" => Ok(SpaceType::InnerProduct),
            "cosinesimil" => Ok(SpaceType::Cosine),
            other => Err(BuilderError::config_field(
                "metric",
                format!("unknown space type '{other}'"),
            )),
        }
    }
}

/// How the built CPU index is staged before upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationMode {
    /// Write to a file inside the run's temporary directory.
    #[default]
    Disk,
    /// Write to an in-memory buffer.
    Memory,
}

/// Engine the artifact is built for. Determines the artifact extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Faiss,
    /// Accepted on the wire; no engine in this crate builds it.
    Nmslib,
}

impl EngineKind {
    /// Canonical file extension of artifacts produced for this engine.
    pub fn extension(&self) -> &'static str {
        match self {
            EngineKind::Faiss => "faiss",
            EngineKind::Nmslib => "nmslib",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Outcome of one pipeline run.
///
/// Exactly one of `file_name` and `error` is set. Construct it through
/// [`TaskResult::success`] or [`TaskResult::failure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Base name of the uploaded artifact (not the full remote path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(file_name: impl Into<String>) -> Self {
        Self {
            file_name: Some(file_name.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            file_name: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
