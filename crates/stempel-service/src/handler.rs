// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-request orchestration: admission, inline streaming, or deferral.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use stempel_core::error::StempelError;
use stempel_core::types::{DeferredRequest, RequestPhase, WatermarkRequest};
use stempel_document::TransformEngine;

use crate::admission::{Admission, AdmissionController};
use crate::pipeline::run_pipeline;
use crate::queue::OverflowQueue;
use crate::resolver::{DestinationSink, FileResolver};

/// What happened to a watermark request.
///
/// Expected outcomes are data, not raised errors: the boundary maps them to
/// response statuses without catching anything.
#[derive(Debug)]
pub enum WatermarkOutcome {
    /// Admitted and transformed inline; the bytes went to the caller's sink.
    Streamed { pages: u32 },
    /// Deferred to the overflow queue; output will appear at `destination`.
    Deferred { destination: String },
    /// The named source does not exist.
    NotFound,
    /// The transform (or the queue) failed.
    Failed(StempelError),
}

/// Orchestrates one inbound request across admission control, the pipeline,
/// and the overflow queue.
pub struct RequestHandler {
    resolver: Arc<dyn FileResolver>,
    engine: Arc<dyn TransformEngine>,
    admission: AdmissionController,
    queue: Arc<Mutex<OverflowQueue>>,
    admission_wait: Duration,
}

impl RequestHandler {
    pub fn new(
        resolver: Arc<dyn FileResolver>,
        engine: Arc<dyn TransformEngine>,
        admission: AdmissionController,
        queue: Arc<Mutex<OverflowQueue>>,
        admission_wait: Duration,
    ) -> Self {
        Self {
            resolver,
            engine,
            admission,
            queue,
            admission_wait,
        }
    }

    /// Handle one request against a live response sink.
    ///
    /// If a slot is granted within the bounded wait, the pipeline streams
    /// into `sink` while the ticket is held; the ticket is released on every
    /// exit path. Otherwise the request is serialized onto the overflow
    /// queue and a deferred acknowledgment referencing the deterministic
    /// destination is returned immediately — without writing to `sink`.
    #[instrument(skip(self, sink, cancel), fields(correlation_id = %request.correlation_id, source = %request.source_name))]
    pub async fn handle(
        &self,
        request: &WatermarkRequest,
        sink: DestinationSink,
        cancel: CancellationToken,
    ) -> WatermarkOutcome {
        info!(phase = ?RequestPhase::Submitted, "watermark request received");

        match self.resolver.exists(&request.source_name).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("source not found");
                return WatermarkOutcome::NotFound;
            }
            Err(err) => {
                error!(error = %err, "source lookup failed");
                return WatermarkOutcome::Failed(err);
            }
        }

        match self.admission.try_admit_bounded(self.admission_wait).await {
            Admission::Granted(ticket) => {
                info!(phase = ?RequestPhase::AdmittedInteractive, "request admitted");

                let source = match self.resolver.open_source(&request.source_name).await {
                    Ok(Some(source)) => source,
                    // Deleted between the existence check and the open.
                    Ok(None) => return WatermarkOutcome::NotFound,
                    Err(err) => return WatermarkOutcome::Failed(err),
                };

                info!(phase = ?RequestPhase::Processing, "pipeline starting");
                let outcome = match run_pipeline(
                    Arc::clone(&self.engine),
                    source,
                    sink,
                    &request.overlay_text,
                    cancel,
                )
                .await
                {
                    Ok(pages) => {
                        info!(pages, phase = ?RequestPhase::Completed, "streamed inline");
                        WatermarkOutcome::Streamed { pages }
                    }
                    Err(err) => {
                        error!(error = %err, phase = ?RequestPhase::Failed, "inline pipeline failed");
                        WatermarkOutcome::Failed(err)
                    }
                };

                // The ticket is released here on success and failure alike.
                drop(ticket);
                outcome
            }
            Admission::Deferred => self.defer(request).await,
        }
    }

    /// Serialize the request onto the overflow queue and acknowledge with
    /// the deterministic destination name.
    async fn defer(&self, request: &WatermarkRequest) -> WatermarkOutcome {
        let deferred = DeferredRequest::from(request);
        let queue = Arc::clone(&self.queue);

        let enqueued = tokio::task::spawn_blocking(move || {
            let queue = queue
                .lock()
                .map_err(|_| StempelError::Database("overflow queue mutex poisoned".into()))?;
            queue.enqueue(&deferred)
        })
        .await
        .map_err(|err| StempelError::Database(format!("enqueue task failed: {err}")))
        .and_then(|result| result);

        match enqueued {
            Ok(message_id) => {
                let destination = request.destination_name();
                info!(
                    message_id,
                    destination = %destination,
                    phase = ?RequestPhase::DeferredQueued,
                    "capacity exhausted; request deferred"
                );
                WatermarkOutcome::Deferred { destination }
            }
            Err(err) => {
                error!(error = %err, "failed to defer request");
                WatermarkOutcome::Failed(err)
            }
        }
    }
}
