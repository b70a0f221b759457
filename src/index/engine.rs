//! The Index Engine seam.
//!
//! An engine owns the graph-construction algorithm and the memory of the
//! structures it creates. The pipeline only ever sees opaque [`RawHandle`]s
//! and hands them back to the engine to convert, persist or release them.
//! Releasing a raw handle twice is a double free inside the engine, which is
//! why every handle is routed through [`crate::index::ownership::OwnershipManager`].

use std::num::NonZeroU64;
use std::path::Path;

use crate::dataset::VectorsDataset;
use crate::index::config::{CpuSearchConfig, IndexBuildConfig};
use crate::types::EngineKind;

/// Opaque pointer-like reference to a structure owned by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    pub fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What a raw handle points at. Engines free each kind differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeKind {
    GpuIndex,
    CpuIndex,
    IdMap,
}

impl std::fmt::Display for NativeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NativeKind::GpuIndex => write!(f, "gpu_index"),
            NativeKind::CpuIndex => write!(f, "cpu_index"),
            NativeKind::IdMap => write!(f, "id_map"),
        }
    }
}

/// Where an index structure lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Gpu,
    Cpu,
}

impl Residency {
    pub fn index_kind(&self) -> NativeKind {
        match self {
            Residency::Gpu => NativeKind::GpuIndex,
            Residency::Cpu => NativeKind::CpuIndex,
        }
    }
}

/// A built index: the graph structure plus the id map wrapping it.
///
/// The id map is optional only so that partially constructed indexes can be
/// described; a successfully built index always has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeIndex {
    pub residency: Residency,
    pub index: RawHandle,
    pub id_map: Option<RawHandle>,
}

impl NativeIndex {
    pub fn gpu(index: RawHandle, id_map: Option<RawHandle>) -> Self {
        Self {
            residency: Residency::Gpu,
            index,
            id_map,
        }
    }

    pub fn cpu(index: RawHandle, id_map: Option<RawHandle>) -> Self {
        Self {
            residency: Residency::Cpu,
            index,
            id_map,
        }
    }

    /// The components in release order: the wrapper first, then what it wraps.
    pub fn components(&self) -> impl Iterator<Item = (RawHandle, NativeKind)> {
        self.id_map
            .map(|raw| (raw, NativeKind::IdMap))
            .into_iter()
            .chain(std::iter::once((self.index, self.residency.index_kind())))
    }
}

/// Failure reported by an engine.
///
/// `partial` carries whatever native structures were allocated before the
/// failure. The caller takes ownership of them and must release them.
#[derive(Debug)]
pub struct EngineError {
    pub message: String,
    pub partial: Option<NativeIndex>,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: None,
        }
    }

    pub fn with_partial(message: impl Into<String>, partial: NativeIndex) -> Self {
        Self {
            message: message.into(),
            partial: Some(partial),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Destination of a persisted CPU index.
#[derive(Debug)]
pub enum PersistDestination<'a> {
    File(&'a Path),
    Buffer(&'a mut Vec<u8>),
}

/// Capability the pipeline drives to build, convert, persist and free indexes.
///
/// All methods are blocking; the pipeline calls them from a blocking thread.
pub trait IndexEngine: Send + Sync {
    /// Engine the produced artifacts are readable by.
    fn kind(&self) -> EngineKind;

    /// Build a device-resident index over `dataset` and wrap it in an id map.
    fn build_gpu_index(
        &self,
        dataset: &VectorsDataset,
        config: &IndexBuildConfig,
    ) -> EngineResult<NativeIndex>;

    /// Copy the graph of `gpu` into a new host-resident index and re-point
    /// the id map of `gpu` at it. Returns the raw handle of the host index.
    ///
    /// The GPU structures are left allocated; freeing them is the caller's job.
    fn convert_to_cpu(&self, gpu: &NativeIndex, config: &CpuSearchConfig) -> EngineResult<RawHandle>;

    /// Serialize a host-resident index, including its id map.
    fn persist(&self, cpu: &NativeIndex, destination: PersistDestination<'_>) -> EngineResult<()>;

    /// Free one native structure.
    fn release(&self, raw: RawHandle, kind: NativeKind) -> EngineResult<()>;
}
