// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Overflow worker — background executor for deferred watermark requests.
//
// The worker drains the durable queue one message at a time: decode, wait
// (unbounded, cancellable) for an admission slot, resolve the source,
// create the deterministic destination, run the pipeline, acknowledge.
// A failed pipeline leaves the message leased so the queue redelivers it;
// a payload that cannot be decoded is dropped permanently — redelivery
// cannot fix a malformed message.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stempel_core::error::{Result, StempelError};
use stempel_core::types::{DeferredRequest, RequestPhase, destination_name};
use stempel_document::TransformEngine;

use crate::admission::AdmissionController;
use crate::pipeline::run_pipeline;
use crate::queue::{OverflowMessage, OverflowQueue};
use crate::resolver::FileResolver;

/// Everything one message needs, shared by handle into the worker task.
#[derive(Clone)]
struct WorkerContext {
    queue: Arc<Mutex<OverflowQueue>>,
    resolver: Arc<dyn FileResolver>,
    engine: Arc<dyn TransformEngine>,
    admission: AdmissionController,
    lease: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

/// Background consumer of the overflow queue.
pub struct OverflowWorker {
    context: WorkerContext,
    /// Handle to the Tokio task running the drain loop.
    task_handle: Option<JoinHandle<()>>,
}

impl OverflowWorker {
    pub fn new(
        queue: Arc<Mutex<OverflowQueue>>,
        resolver: Arc<dyn FileResolver>,
        engine: Arc<dyn TransformEngine>,
        admission: AdmissionController,
        lease: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            context: WorkerContext {
                queue,
                resolver,
                engine,
                admission,
                lease,
                poll_interval,
                cancel: CancellationToken::new(),
            },
            task_handle: None,
        }
    }

    /// Spawn the drain loop. Idempotent: a second call while running is a
    /// no-op.
    pub fn start(&mut self) {
        if self.task_handle.is_some() {
            debug!("overflow worker already running");
            return;
        }
        let context = self.context.clone();
        info!("overflow worker starting");
        self.task_handle = Some(tokio::spawn(async move {
            run_loop(context).await;
        }));
    }

    /// Signal the drain loop to stop and await its completion. A message
    /// being processed is abandoned at the next cancellation checkpoint and
    /// redelivered after its lease expires.
    pub async fn stop(&mut self) {
        self.context.cancel.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "overflow worker task join failed");
            }
        }
        info!("overflow worker stopped");
    }
}

/// The main drain loop. Runs until cancelled.
async fn run_loop(context: WorkerContext) {
    loop {
        if context.cancel.is_cancelled() {
            break;
        }

        match receive_one(&context).await {
            Ok(Some(message)) => process_message(&context, message).await,
            Ok(None) => {
                // Queue empty: poll again after a pause, unless shutting down.
                tokio::select! {
                    _ = context.cancel.cancelled() => break,
                    _ = tokio::time::sleep(context.poll_interval) => {}
                }
            }
            Err(err) => {
                error!(error = %err, "overflow queue receive failed");
                tokio::select! {
                    _ = context.cancel.cancelled() => break,
                    _ = tokio::time::sleep(context.poll_interval) => {}
                }
            }
        }
    }
    debug!("overflow worker loop exited");
}

/// Lease the next available message, off the async thread.
async fn receive_one(context: &WorkerContext) -> Result<Option<OverflowMessage>> {
    let queue = Arc::clone(&context.queue);
    let lease = context.lease;
    tokio::task::spawn_blocking(move || {
        let queue = queue
            .lock()
            .map_err(|_| StempelError::Database("overflow queue mutex poisoned".into()))?;
        queue.receive(lease)
    })
    .await
    .map_err(|err| StempelError::Database(format!("receive task failed: {err}")))?
}

/// Delete a message, off the async thread. Failures are logged, not
/// propagated: the worst case is a redundant redelivery, which consumers
/// already tolerate.
async fn remove_message(context: &WorkerContext, id: i64, discard: bool) {
    let queue = Arc::clone(&context.queue);
    let result = tokio::task::spawn_blocking(move || {
        let queue = queue
            .lock()
            .map_err(|_| StempelError::Database("overflow queue mutex poisoned".into()))?;
        if discard {
            queue.discard(id)
        } else {
            queue.acknowledge(id)
        }
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(message_id = id, error = %err, "failed to remove message"),
        Err(err) => error!(message_id = id, error = %err, "remove task failed"),
    }
}

/// Process one leased message end to end.
async fn process_message(context: &WorkerContext, message: OverflowMessage) {
    let request: DeferredRequest = match message.decode() {
        Ok(request) => request,
        Err(err) => {
            // A malformed message cannot be fixed by redelivery.
            error!(
                message_id = message.id,
                deliveries = message.deliveries,
                error = %err,
                payload = %message.payload,
                "dropping malformed overflow message"
            );
            remove_message(context, message.id, true).await;
            return;
        }
    };

    // The queue already buffers excess load, so wait as long as it takes.
    let Some(ticket) = context.admission.admit_blocking(&context.cancel).await else {
        // Shutting down; the lease will expire and another worker run will
        // pick the message up.
        debug!(message_id = message.id, "admission wait cancelled");
        return;
    };

    info!(
        message_id = message.id,
        source = %request.source_name,
        deliveries = message.deliveries,
        phase = ?RequestPhase::Processing,
        "processing deferred request"
    );

    let outcome = run_deferred(context, &request).await;
    drop(ticket);

    match outcome {
        Ok(pages) => {
            info!(
                message_id = message.id,
                source = %request.source_name,
                pages,
                phase = ?RequestPhase::Completed,
                "deferred watermark completed"
            );
            remove_message(context, message.id, false).await;
        }
        Err(err) if err.is_terminal() => {
            // No redelivery can make a missing source appear.
            warn!(
                message_id = message.id,
                source = %request.source_name,
                error = %err,
                "deferred request failed terminally"
            );
            remove_message(context, message.id, false).await;
        }
        Err(err) => {
            // Leave the message leased; the queue redelivers after expiry
            // and the retry rewrites the destination from scratch.
            error!(
                message_id = message.id,
                source = %request.source_name,
                deliveries = message.deliveries,
                error = %err,
                phase = ?RequestPhase::Failed,
                "deferred request failed; leaving message for redelivery"
            );
        }
    }
}

/// Resolve, transform, and write one deferred request to its deterministic
/// destination.
async fn run_deferred(context: &WorkerContext, request: &DeferredRequest) -> Result<u32> {
    let source = context
        .resolver
        .open_source(&request.source_name)
        .await?
        .ok_or_else(|| StempelError::SourceNotFound(request.source_name.clone()))?;

    let destination = destination_name(&request.source_name);
    let sink = context.resolver.create_destination(&destination).await?;

    run_pipeline(
        Arc::clone(&context.engine),
        source,
        sink,
        &request.overlay_text,
        context.cancel.child_token(),
    )
    .await
}
