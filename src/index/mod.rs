//! Index construction: configuration, the engine seam and native ownership.
//!
//! The pipeline drives an [`IndexEngine`] and routes every structure the
//! engine returns through an [`OwnershipManager`]. [`FlatEngine`] is the
//! host-only engine; `CuvsEngine` drives CAGRA when built with `cuvs`.

pub mod assembler;
pub mod config;
#[cfg(feature = "cuvs")]
pub mod cuvs;
pub mod engine;
pub mod flat;
pub mod ownership;

pub use assembler::{assemble, ConfigOverrides, DerivedParams};
pub use config::IndexBuildConfig;
#[cfg(feature = "cuvs")]
pub use cuvs::CuvsEngine;
pub use engine::{IndexEngine, NativeIndex, NativeKind, RawHandle, Residency};
pub use flat::FlatEngine;
pub use ownership::{HandleId, HandleState, OwnershipManager, OwnershipStats, TrackedIndex};
