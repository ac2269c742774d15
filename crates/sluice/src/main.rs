//! Sluice CLI: realtime ingestion of NDJSON rows into time-bucketed segments.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sluice::coordination::{
    InMemorySegmentAnnouncer, InMemoryServerView, PublishNotifyingPublisher, SegmentPublisherRef,
    StorageSegmentPublisher, StorageSegmentPusher,
};
use sluice::source::run_source;
use sluice::{
    CliArgs, Config, PlumberMetrics, RealtimePlumber, RealtimePlumberSchool, StorageProvider,
    init_metrics, init_tracing, shutdown_signal,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.metrics.enabled {
        if let Err(e) = init_metrics(&config.metrics.address) {
            eprintln!("Failed to start metrics server: {e}");
            return ExitCode::FAILURE;
        }
    }

    let plumber = match build_plumber(&config).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to build plumber: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = plumber.start_job().await {
        eprintln!("Failed to start plumber: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => match tokio::fs::File::open(path).await {
            Ok(file) => Box::new(BufReader::new(file)),
            Err(e) => {
                eprintln!("Failed to open {}: {e}", path.display());
                shutdown.cancel();
                return finish(&plumber).await;
            }
        },
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    match run_source(reader, &plumber, plumber.metrics(), shutdown.clone()).await {
        Ok(_) if !shutdown.is_cancelled() => {
            info!("Input exhausted, waiting for shutdown signal to drain");
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "Row source failed");
            shutdown.cancel();
        }
    }

    shutdown.cancelled().await;
    finish(&plumber).await
}

async fn build_plumber(config: &Config) -> Result<RealtimePlumber, Box<dyn std::error::Error>> {
    let deep_storage = Arc::new(
        StorageProvider::for_url_with_options(
            &config.deep_storage.url,
            config.deep_storage.options.clone(),
        )
        .await?,
    );
    let metadata_store = Arc::new(
        StorageProvider::for_url_with_options(
            &config.metadata_store.url,
            config.metadata_store.options.clone(),
        )
        .await?,
    );

    let server_view = Arc::new(InMemoryServerView::new());
    let storage_publisher: SegmentPublisherRef =
        Arc::new(StorageSegmentPublisher::new(metadata_store));
    let publisher: SegmentPublisherRef = if config.handoff.assume_served_on_publish {
        Arc::new(PublishNotifyingPublisher::new(
            storage_publisher,
            server_view.clone(),
        ))
    } else {
        warn!("No historical is wired to this process; segments will stay local after close");
        storage_publisher
    };

    info!(
        target = %config.schema.data_source,
        deep_storage = %config.deep_storage.url,
        metadata_store = %config.metadata_store.url,
        "Starting sluice"
    );

    let school = RealtimePlumberSchool::new(config.plumber.to_plumber_config())
        .with_rejection_policy(config.rejection_policy.to_policy())
        .with_versioning_policy(config.versioning_policy.to_policy())
        .with_announcer(Arc::new(InMemorySegmentAnnouncer::new()))
        .with_publisher(publisher)
        .with_pusher(Arc::new(StorageSegmentPusher::new(deep_storage)))
        .with_server_view(server_view);

    Ok(school.find_plumber(config.schema.clone(), Arc::new(PlumberMetrics::new()))?)
}

async fn finish(plumber: &RealtimePlumber) -> ExitCode {
    let result = plumber.finish_job().await;
    let snapshot = plumber.metrics().snapshot();
    info!(
        processed = snapshot.processed,
        thrown_away = snapshot.thrown_away,
        unparseable = snapshot.unparseable,
        segments_pushed = snapshot.segments_pushed,
        handed_off = snapshot.handed_off,
        "Shutdown complete"
    );

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Plumber failed to drain: {e}");
            ExitCode::FAILURE
        }
    }
}
