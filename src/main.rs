use std::{process, sync::Arc, time::Duration};

use cachekeeper::{
    cache::{CacheEngine, MemoryReport},
    config::{self, FlushArgs, GovernArgs, MemoryArgs, Settings},
    infra::{error::InfraError, telemetry},
    store::{KeyValueStore, RedisStore},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "cachekeeper failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "cachekeeper failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let engine = connect(&settings).await?;

    let result = match &cli_args.command {
        config::Command::Govern(args) => run_govern(&engine, args).await,
        config::Command::Memory(args) => run_memory(&engine, args).await,
        config::Command::Flush(args) => run_flush(&engine, args).await,
    };

    if !engine.shutdown(SHUTDOWN_GRACE).await {
        warn!("background cache tasks still running at exit");
    }
    result
}

async fn connect(settings: &Settings) -> Result<CacheEngine, InfraError> {
    let store = RedisStore::connect(&settings.store.url).await?;
    info!(namespace = %settings.cache.namespace, "connected to store");
    let store: Arc<dyn KeyValueStore> = Arc::new(store);
    Ok(CacheEngine::new(store, settings.cache.clone()))
}

async fn run_govern(engine: &CacheEngine, args: &GovernArgs) -> Result<(), InfraError> {
    if args.once {
        return if engine.governor().check_and_enforce().await {
            Ok(())
        } else {
            Err(InfraError::configuration(
                "memory governor could not query the store",
            ))
        };
    }

    info!(
        interval_secs = engine.config().governor.interval().as_secs(),
        "memory governor started"
    );
    engine.governor().check_and_enforce().await;
    let handle = engine.spawn_governor();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    CacheEngine::stop_governor(handle).await;
    Ok(())
}

async fn run_memory(engine: &CacheEngine, args: &MemoryArgs) -> Result<(), InfraError> {
    let report = engine.governor().report().await?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|err| InfraError::configuration(err.to_string()))?;
        println!("{rendered}");
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &MemoryReport) {
    match report.ceiling_bytes {
        Some(ceiling) => println!(
            "used {} of {} bytes (threshold {})",
            report.used_bytes,
            ceiling,
            report.threshold_bytes.unwrap_or(ceiling)
        ),
        None => println!("used {} bytes (no ceiling)", report.used_bytes),
    }
    for usage in &report.categories {
        let quota = usage
            .quota_bytes
            .map(|bytes| bytes.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} keys={:<8} bytes={:<12} quota={}",
            usage.category.as_str(),
            usage.keys,
            usage.estimate.total_bytes,
            quota
        );
    }
}

async fn run_flush(engine: &CacheEngine, args: &FlushArgs) -> Result<(), InfraError> {
    let removed = engine.records().invalidate_pattern(&args.pattern).await;
    info!(pattern = %args.pattern, removed, "flushed keys");
    println!("{removed}");
    Ok(())
}
