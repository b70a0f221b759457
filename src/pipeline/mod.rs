//! The build pipeline.
//!
//! One run moves a request through
//! `Configuring -> Fetching -> Building -> Converting -> Persisting -> Uploading`
//! strictly in order. The first failing stage ends the run; its error is
//! reported in the returned [`TaskResult`] and never escapes `run`.
//!
//! Every native structure of a run is owned by a per-run
//! [`OwnershipManager`] which frees anything still live when the run ends,
//! including when the run future is dropped mid-flight.

pub mod staging;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dataset::{StagingBuffer, VectorSink, VectorsDataset};
use crate::error::{BuilderError, Result};
use crate::index::assembler::assemble;
use crate::index::config::IndexBuildConfig;
use crate::index::engine::IndexEngine;
use crate::index::ownership::{OwnershipManager, OwnershipStats, TrackedIndex};
use crate::params::{base_name, BuildParameters};
use crate::storage::{ObjectStoreClient, ObjectStoreProvider};
use crate::types::TaskResult;

pub use staging::SerializationTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Configuring,
    Fetching,
    Building,
    Converting,
    Persisting,
    Uploading,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Configuring => "configuring",
            Stage::Fetching => "fetching",
            Stage::Building => "building",
            Stage::Converting => "converting",
            Stage::Persisting => "persisting",
            Stage::Uploading => "uploading",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error that ended a run and the stage it happened in.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: BuilderError,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageFailure {}

fn at(stage: Stage) -> impl Fn(BuilderError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// Everything known about a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub result: TaskResult,
    pub failed_stage: Option<Stage>,
    /// Native handle bookkeeping of the run, taken after final cleanup.
    pub handles: OwnershipStats,
}

/// Runs index builds against one engine and one set of object stores.
///
/// Holds no per-run state; independent runs may execute concurrently.
pub struct BuildPipeline {
    engine: Arc<dyn IndexEngine>,
    stores: Arc<dyn ObjectStoreProvider>,
    config: PipelineConfig,
}

impl BuildPipeline {
    pub fn new(
        engine: Arc<dyn IndexEngine>,
        stores: Arc<dyn ObjectStoreProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            engine,
            stores,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build, convert, persist and upload the index described by `params`.
    pub async fn run(&self, params: &BuildParameters) -> TaskResult {
        self.run_with_report(params).await.result
    }

    #[instrument(
        skip(self, params),
        fields(
            run_id = tracing::field::Empty,
            vector_path = params.vector_path(),
            doc_count = params.doc_count()
        )
    )]
    pub async fn run_with_report(&self, params: &BuildParameters) -> RunReport {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let ownership = Arc::new(OwnershipManager::new(self.engine.clone()));

        let outcome = self.execute(params, &ownership).await;

        let leaked = ownership.release_all();
        if leaked > 0 {
            warn!(leaked, "native indexes were still live when the run ended");
        }
        let handles = ownership.stats();

        let (result, failed_stage) = match outcome {
            Ok(file_name) => {
                crate::metrics::RUNS_TOTAL.with_label_values(&["success"]).inc();
                info!(
                    file_name = %file_name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "index build finished"
                );
                (TaskResult::success(file_name), None)
            }
            Err(failure) => {
                crate::metrics::RUNS_TOTAL.with_label_values(&["failure"]).inc();
                error!(
                    stage = %failure.stage,
                    kind = %failure.error.kind(),
                    error = %failure.error,
                    "index build failed"
                );
                (TaskResult::failure(failure.to_string()), Some(failure.stage))
            }
        };

        RunReport {
            run_id,
            result,
            failed_stage,
            handles,
        }
    }

    async fn execute(
        &self,
        params: &BuildParameters,
        ownership: &Arc<OwnershipManager>,
    ) -> std::result::Result<String, StageFailure> {
        let deadline = self
            .config
            .stage_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let enter = |stage: Stage| -> std::result::Result<Instant, StageFailure> {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(StageFailure {
                        stage,
                        error: BuilderError::Timeout(format!(
                            "deadline passed before {stage} stage"
                        )),
                    });
                }
            }
            debug!(%stage, "entering stage");
            Ok(Instant::now())
        };

        let t = enter(Stage::Configuring)?;
        if params.engine() != self.engine.kind() {
            return Err(StageFailure {
                stage: Stage::Configuring,
                error: BuilderError::config_field(
                    "engine",
                    format!(
                        "request is for {} but this builder produces {} indexes",
                        params.engine(),
                        self.engine.kind()
                    ),
                ),
            });
        }
        let config = assemble(&params.effective_overrides(), &params.derived_params())
            .map_err(at(Stage::Configuring))?;
        let store = self
            .stores
            .object_store(params)
            .map_err(at(Stage::Configuring))?;
        let remote_path = params.artifact_path();
        let mut target = SerializationTarget::create(
            &self.config.staging_dir,
            params.serialization_mode(),
            &remote_path,
        )
        .map_err(at(Stage::Configuring))?;
        observe(Stage::Configuring, t);

        let t = enter(Stage::Fetching)?;
        let dataset = fetch(store.as_ref(), params)
            .await
            .map_err(at(Stage::Fetching))?;
        observe(Stage::Fetching, t);

        let t = enter(Stage::Building)?;
        let (mut dataset, gpu) = self
            .build(dataset, config.clone(), ownership)
            .await
            .map_err(at(Stage::Building))?;
        observe(Stage::Building, t);

        let t = enter(Stage::Converting)?;
        let cpu = self
            .convert(gpu, &config, ownership)
            .await
            .map_err(at(Stage::Converting))?;
        // The CPU index holds its own copy of the vectors.
        dataset.release();
        drop(dataset);
        observe(Stage::Converting, t);

        let t = enter(Stage::Persisting)?;
        target = self
            .persist(cpu, target, ownership)
            .await
            .map_err(at(Stage::Persisting))?;
        observe(Stage::Persisting, t);

        let t = enter(Stage::Uploading)?;
        let source = target.artifact_source();
        store
            .write_blob(&source, &remote_path)
            .await
            .map_err(at(Stage::Uploading))?;
        drop(source);
        target.close();
        observe(Stage::Uploading, t);

        Ok(base_name(&remote_path).to_string())
    }

    async fn build(
        &self,
        dataset: VectorsDataset,
        config: IndexBuildConfig,
        ownership: &Arc<OwnershipManager>,
    ) -> Result<(VectorsDataset, TrackedIndex)> {
        let engine = self.engine.clone();
        let manager = ownership.clone();
        // Registration happens on the blocking thread so that a run dropped
        // mid-build still hands the index to the manager.
        let (dataset, built) = tokio::task::spawn_blocking(move || {
            let built = match engine.build_gpu_index(&dataset, &config) {
                Ok(native) => Ok(manager.register(native)),
                Err(e) => {
                    if let Some(partial) = e.partial {
                        let orphan = manager.register(partial);
                        manager.release(orphan.id());
                    }
                    Err(BuilderError::Build(e.message))
                }
            };
            (dataset, built)
        })
        .await
        .map_err(|e| BuilderError::Internal(format!("build task failed: {e}")))?;

        Ok((dataset, built?))
    }

    async fn convert(
        &self,
        gpu: TrackedIndex,
        config: &IndexBuildConfig,
        ownership: &Arc<OwnershipManager>,
    ) -> Result<TrackedIndex> {
        let engine = self.engine.clone();
        let manager = ownership.clone();
        let cpu_config = config.cpu.clone();
        tokio::task::spawn_blocking(move || {
            manager.transfer(gpu, |native| engine.convert_to_cpu(native, &cpu_config))
        })
        .await
        .map_err(|e| BuilderError::Internal(format!("conversion task failed: {e}")))?
    }

    async fn persist(
        &self,
        cpu: TrackedIndex,
        mut target: SerializationTarget,
        ownership: &Arc<OwnershipManager>,
    ) -> Result<SerializationTarget> {
        let engine = self.engine.clone();
        let manager = ownership.clone();
        let id = cpu.id();
        let joined = tokio::task::spawn_blocking(move || {
            let persisted =
                manager.with_native(id, |native| engine.persist(native, target.destination()));
            (target, persisted)
        })
        .await;

        // The CPU index is never reused, whatever the outcome.
        ownership.release(id);

        let (target, persisted) =
            joined.map_err(|e| BuilderError::Internal(format!("persist task failed: {e}")))?;
        persisted?.map_err(|e| BuilderError::Persist(e.message))?;
        debug!(bytes = target.len(), mode = ?target.mode(), "persisted CPU index");
        Ok(target)
    }
}

fn observe(stage: Stage, started: Instant) {
    crate::metrics::STAGE_DURATION
        .with_label_values(&[stage.as_str()])
        .observe(started.elapsed().as_secs_f64());
}

/// Download vectors and ids concurrently into separate staging buffers.
#[instrument(
    skip(store, params),
    fields(vector_path = params.vector_path(), doc_id_path = params.doc_id_path())
)]
async fn fetch(store: &dyn ObjectStoreClient, params: &BuildParameters) -> Result<VectorsDataset> {
    let mut vectors = VectorSink::for_data_type(params.data_type(), params.vector_blob_len());
    let mut ids = StagingBuffer::with_limit(params.doc_id_blob_len());

    let (vector_bytes, id_bytes) = tokio::try_join!(
        store.read_blob(params.vector_path(), &mut vectors),
        store.read_blob(params.doc_id_path(), &mut ids),
    )?;
    debug!(vector_bytes, id_bytes, "downloaded build inputs");

    VectorsDataset::parse(
        vectors.freeze(),
        ids.freeze(),
        params.dimension(),
        params.doc_count(),
        params.data_type(),
    )
}
