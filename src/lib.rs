//! Remote index builder: builds GPU ANN indexes from vectors in object storage.

pub mod config;
pub mod dataset;
pub mod error;
pub mod index;
pub mod jobs;
pub mod metrics;
pub mod params;
pub mod pipeline;
pub mod storage;
pub mod types;
