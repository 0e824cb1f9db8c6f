// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stempel — streaming PDF watermark service daemon.
//
// Entry point. Initialises logging, loads configuration, wires the
// admission controller, overflow queue, worker, and HTTP surface, then
// runs until interrupted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stempel_core::AppConfig;
use stempel_core::error::{Result, StempelError};
use stempel_document::LopdfEngine;
use stempel_service::{
    AdmissionController, FileResolver, LocalFileResolver, OverflowQueue, OverflowWorker,
    RequestHandler, WatermarkServer,
};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Stempel starting");

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal error");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Optional config path as the first argument; defaults otherwise.
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    tracing::info!(
        port = config.server_port,
        capacity = config.capacity,
        storage = %config.storage_dir.display(),
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.storage_dir)?;

    let resolver: Arc<dyn FileResolver> = Arc::new(LocalFileResolver::new(&config.storage_dir));
    let engine = Arc::new(LopdfEngine::new());
    let admission = AdmissionController::new(config.capacity);

    let queue_path = config.queue_db_path.clone();
    let queue = tokio::task::spawn_blocking(move || OverflowQueue::open(queue_path))
        .await
        .map_err(|err| StempelError::Database(format!("queue open task failed: {err}")))??;
    let queue = Arc::new(Mutex::new(queue));

    let mut worker = OverflowWorker::new(
        Arc::clone(&queue),
        Arc::clone(&resolver),
        engine.clone(),
        admission.clone(),
        Duration::from_secs(config.queue_lease_secs),
        Duration::from_millis(config.queue_poll_ms),
    );
    worker.start();

    let handler = Arc::new(RequestHandler::new(
        Arc::clone(&resolver),
        engine,
        admission,
        queue,
        Duration::from_millis(config.admission_wait_ms),
    ));

    let mut server = WatermarkServer::new(config.server_port, handler, resolver);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    server.stop().await?;
    worker.stop().await;

    tracing::info!("Stempel stopped");
    Ok(())
}
