use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use remote_index_builder::config::Config;
use remote_index_builder::error::{BuilderError, Result};
use remote_index_builder::index::IndexEngine;
use remote_index_builder::params::{BuildParameters, BuildRequest};
use remote_index_builder::pipeline::BuildPipeline;
use remote_index_builder::storage::ObjectStoreFactory;
use remote_index_builder::types::TaskResult;

const USAGE: &str = "usage: remote-index-builder <request.json> [--config <config.toml>]";

struct Args {
    request: String,
    config: Option<String>,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let mut request = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(args.next().ok_or("--config needs a path")?),
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ if request.is_none() => request = Some(arg),
            other => return Err(format!("unexpected argument '{other}'\n{USAGE}")),
        }
    }
    Ok(Args {
        request: request.ok_or_else(|| USAGE.to_string())?,
        config,
    })
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[cfg(feature = "cuvs")]
fn engine() -> Result<Arc<dyn IndexEngine>> {
    let engine = remote_index_builder::index::CuvsEngine::new()
        .map_err(|e| BuilderError::Internal(format!("failed to initialize cuvs: {e}")))?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "cuvs"))]
fn engine() -> Result<Arc<dyn IndexEngine>> {
    tracing::warn!("built without cuvs, using the host-only flat engine");
    Ok(Arc::new(remote_index_builder::index::FlatEngine::new()))
}

fn load_request(path: &str) -> Result<BuildParameters> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BuilderError::InvalidParameters(format!("failed to read {path}: {e}")))?;
    let request: BuildRequest = serde_json::from_str(&content)?;
    BuildParameters::try_from(request)
}

async fn run(args: Args, config: Config) -> Result<TaskResult> {
    let params = load_request(&args.request)?;
    let stores = Arc::new(ObjectStoreFactory::new(config.storage.clone()));
    let pipeline = BuildPipeline::new(engine()?, stores, config.pipeline.clone());
    Ok(pipeline.run(&params).await)
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::from(2);
        }
    };
    // Still single-threaded here.
    for (name, value) in config.pipeline.thread_env() {
        std::env::set_var(name, value);
    }
    init_logging(&config);
    remote_index_builder::metrics::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(request = %args.request, "remote index builder starting");

    let result = match runtime.block_on(run(args, config)) {
        Ok(result) => result,
        Err(e) => TaskResult::failure(e.to_string()),
    };

    match serde_json::to_string(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to encode result: {e}"),
    }
    tracing::debug!(metrics = %remote_index_builder::metrics::gather_text(), "final metrics");

    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
